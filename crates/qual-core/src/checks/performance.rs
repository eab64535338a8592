use std::io::Write;

use tracing::warn;

use crate::{
    checks::{Check, CheckContext},
    device::{Accelerator, Precision},
    error::{CheckError, Result},
    grade::{GradedMetric, Tier, aggregate},
    report::{Reporter, tier_line},
    workload::{BandwidthParams, ComputeParams, Workload, WorkloadOutcome, run_workload},
};

const MIB: u64 = 1024 * 1024;

/// Benchmark shapes. The defaults saturate an RTX 3090 for a few seconds each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerfConfig {
    pub matrix_size: usize,
    pub warmup: u32,
    pub fp32_iterations: u32,
    pub fp16_iterations: u32,
    pub bandwidth_mib: u64,
    pub bandwidth_iterations: u32,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            matrix_size: 8192,
            warmup: 5,
            fp32_iterations: 20,
            fp16_iterations: 40,
            bandwidth_mib: 2000,
            bandwidth_iterations: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PerformanceCheck {
    pub config: PerfConfig,
}

impl PerformanceCheck {
    pub fn new(config: PerfConfig) -> Self {
        Self { config }
    }

    fn matmul<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
        precision: Precision,
        iterations: u32,
    ) -> Result<WorkloadOutcome> {
        let workload = Workload::Compute(ComputeParams {
            size: self.config.matrix_size,
            precision,
            warmup: self.config.warmup,
            iterations,
        });
        let outcome = run_workload(ctx, &workload, &mut |_| {})?;
        ctx.device.release_cached()?;
        report.line(format!("   Time: {:.2}s", outcome.elapsed.as_secs_f64()));
        Ok(outcome)
    }
}

impl PerformanceCheck {
    /// Run the three benchmarks in order, pushing each graded metric as soon
    /// as it is measured so an interruption keeps what was gathered.
    fn benchmarks<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
        graded: &mut Vec<GradedMetric>,
    ) -> Result<()> {
        let profile = ctx.profile;
        let cfg = &self.config;

        let fp32_table = profile.fp32_tflops.table();
        report.section("1️⃣  FP32 Matrix Multiplication (Compute)");
        report.line(format!("   Size: {0}x{0}", cfg.matrix_size));
        report.line(format!("   Iterations: {}", cfg.fp32_iterations));
        let outcome = self.matmul(ctx, report, Precision::F32, cfg.fp32_iterations)?;
        let fp32 = outcome.first("FP32").unwrap_or(0.0);
        let fp32 = GradedMetric::new("FP32", fp32, "TFLOPS", &fp32_table);
        report.line(format!("   Performance: {:.2} TFLOPS", fp32.value));
        report.line(format!("   {}", tier_line(fp32.tier, &fp32_table, "TFLOPS")));
        graded.push(fp32);

        let fp16_table = profile.fp16_tflops.table();
        report.section("2️⃣  FP16 Matrix Multiplication (Tensor Cores)");
        report.line(format!("   Iterations: {}", cfg.fp16_iterations));
        let outcome = self.matmul(ctx, report, Precision::F16, cfg.fp16_iterations)?;
        let fp16 = outcome.first("FP16").unwrap_or(0.0);
        let fp16 = GradedMetric::new("FP16", fp16, "TFLOPS", &fp16_table);
        report.line(format!("   Performance: {:.2} TFLOPS", fp16.value));
        report.line(format!("   {}", tier_line(fp16.tier, &fp16_table, "TFLOPS")));
        graded.push(fp16);

        let bandwidth_table = profile.bandwidth_gbs.table();
        report.section("3️⃣  Memory Bandwidth Test");
        report.line(format!("   Buffer: {} MiB", cfg.bandwidth_mib));
        let workload = Workload::Bandwidth(BandwidthParams {
            bytes: cfg.bandwidth_mib * MIB,
            warmup: cfg.warmup,
            iterations: cfg.bandwidth_iterations,
        });
        let outcome = run_workload(ctx, &workload, &mut |_| {})?;
        ctx.device.release_cached()?;
        let bandwidth = outcome.first("Bandwidth").unwrap_or(0.0);
        let bandwidth = GradedMetric::new("Bandwidth", bandwidth, "GB/s", &bandwidth_table);
        report.line(format!("   Bandwidth: {:.2} GB/s", bandwidth.value));
        report.line(format!("   {}", tier_line(bandwidth.tier, &bandwidth_table, "GB/s")));
        graded.push(bandwidth);
        Ok(())
    }

    /// Verdict for a run stopped early. Only the finished benchmarks count: any
    /// failing one fails the check, otherwise it passes partially, capped at
    /// GOOD and lowered to WARNING by an acceptable metric.
    fn partial<W: Write>(&self, graded: &[GradedMetric], report: &mut Reporter<W>) -> Tier {
        let title = self.title();
        report.section("⚠️  Test interrupted by user");
        report.line(format!("   Completed {} of 3 benchmarks", graded.len()));
        for metric in graded {
            report.line(format!(
                "   {}: {:.2} {} ({})",
                metric.metric, metric.value, metric.unit, metric.tier
            ));
        }

        let failures = aggregate(graded).failures;
        if !failures.is_empty() {
            let mut details = vec!["❌ Performance significantly below expected".to_string()];
            details.extend(failures.iter().map(failure_line));
            report.verdict(&format!("❌ {title}: FAIL"), &details);
            return Tier::Fail;
        }
        if graded.iter().any(|metric| metric.tier == Tier::Acceptable) {
            report.verdict(
                &format!("⚠️  {title}: WARNING (partial)"),
                &["⚠️  Completed benchmarks were below expected but usable"],
            );
            return Tier::Acceptable;
        }
        report.verdict(
            &format!("✅ {title}: PASS (partial)"),
            &["✓ No failing measurements before interruption"],
        );
        Tier::Good
    }
}

fn failure_line(metric: &GradedMetric) -> String {
    let required = metric
        .required
        .map(|bound| format!(" (expected >= {bound})"))
        .unwrap_or_default();
    format!("   - {}: {:.1} {}{required}", metric.metric, metric.value, metric.unit)
}

impl Check for PerformanceCheck {
    fn title(&self) -> &'static str {
        "PERFORMANCE BENCHMARK"
    }

    fn execute<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
    ) -> Result<Tier> {
        let info = ctx.device.info()?;
        report.section(&format!("🔧 GPU: {}", info.name));
        report.rule();

        let mut graded = Vec::with_capacity(3);
        match self.benchmarks(ctx, report, &mut graded) {
            Ok(()) => {}
            Err(CheckError::UserInterrupted { iterations }) => {
                warn!(iterations, finished = graded.len(), "benchmark interrupted");
                return Ok(self.partial(&graded, report));
            }
            Err(err) => return Err(err),
        }

        report.blank();
        report.banner("PERFORMANCE SUMMARY");
        for (label, metric) in ["FP32 Performance:", "FP16 Performance:", "Memory Bandwidth:"]
            .iter()
            .zip(&graded)
        {
            report.line(format!("{label:<18} {:.2} {}", metric.value, metric.unit));
        }

        let overall = aggregate(&graded);
        match overall.tier {
            Tier::Excellent => {
                report.verdict("✅ PERFORMANCE TEST: PASS (Excellent)", &[] as &[&str]);
            }
            Tier::Good => {
                report.verdict("✅ PERFORMANCE TEST: PASS (Good)", &[] as &[&str]);
            }
            Tier::Acceptable => {
                report.verdict(
                    "⚠️  PERFORMANCE TEST: WARNING (Acceptable)",
                    &[
                        "⚠️  Performance below expected but usable".to_string(),
                        format!("⚠️  {}", ctx.profile.advice.performance_warning),
                    ],
                );
            }
            Tier::Fail => {
                let mut details = vec!["❌ Performance significantly below expected".to_string()];
                details.extend(overall.failures.iter().map(failure_line));
                report.verdict("❌ PERFORMANCE TEST: FAIL", &details);
            }
        }
        Ok(overall.tier)
    }
}
