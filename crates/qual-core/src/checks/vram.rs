use std::{io::Write, str::FromStr, time::Duration};

use crate::{
    checks::{Check, CheckContext},
    device::{Accelerator, GB, Precision},
    error::Result,
    grade::Tier,
    report::Reporter,
    workload::{Progress, StressPlan, Workload, run_workload},
};

pub const MIN_SIZE_GB: u32 = 4;
pub const MAX_SIZE_GB: u32 = 23;
/// Free memory a requested size must leave untouched before it is trusted.
const HEADROOM_GB: u64 = 2;
/// Memory already held by others above which the report warns.
const FOREIGN_WARN_BYTES: u64 = 1_000_000_000;
const BYTES_PER_GB: u64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VramSize {
    /// 70% of the memory free when the check starts.
    Auto,
    Gigabytes(u32),
}

impl FromStr for VramSize {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(VramSize::Auto);
        }
        let size = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| "Size must be a number or 'auto'".to_string())?;
        if !(MIN_SIZE_GB..=MAX_SIZE_GB).contains(&size) {
            return Err(format!("Size must be between {MIN_SIZE_GB}-{MAX_SIZE_GB} GB"));
        }
        Ok(VramSize::Gigabytes(size))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VramConfig {
    pub duration: Duration,
    pub size: VramSize,
}

impl Default for VramConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5 * 60),
            size: VramSize::Gigabytes(20),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeDecision {
    Requested(u32),
    Auto(u32),
    /// The request did not fit with headroom and was shrunk.
    Reduced { requested: u32, size: u32 },
}

impl SizeDecision {
    pub fn size_gb(&self) -> u32 {
        match *self {
            SizeDecision::Requested(size) | SizeDecision::Auto(size) => size,
            SizeDecision::Reduced { size, .. } => size,
        }
    }
}

/// Settle the test size: honour an explicit request when it fits with
/// headroom, otherwise fall back to 70% of free memory, rounded down, with a
/// floor of [`MIN_SIZE_GB`].
pub fn choose_size(requested: VramSize, free_bytes: u64) -> SizeDecision {
    let fitted = free_bytes.saturating_mul(7) / 10 / BYTES_PER_GB;
    let fitted = u32::try_from(fitted).unwrap_or(u32::MAX).max(MIN_SIZE_GB);
    match requested {
        VramSize::Auto => SizeDecision::Auto(fitted),
        VramSize::Gigabytes(size)
            if free_bytes < (u64::from(size) + HEADROOM_GB) * BYTES_PER_GB =>
        {
            SizeDecision::Reduced {
                requested: size,
                size: fitted,
            }
        }
        VramSize::Gigabytes(size) => SizeDecision::Requested(size),
    }
}

/// How a test size is split: three equal FP32 buffers take 80%, the rest is
/// headroom for the auxiliary matmuls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPlan {
    pub elements: usize,
    pub buffer_bytes: u64,
    pub total_bytes: u64,
    pub headroom_bytes: u64,
}

pub fn plan_buffers(size_gb: u32) -> BufferPlan {
    let budget = u64::from(size_gb) * BYTES_PER_GB;
    let element_bytes = Precision::F32.size_bytes() as u64;
    let elements = budget * 8 / 10 / 3 / element_bytes;
    let buffer_bytes = elements * element_bytes;
    let total_bytes = buffer_bytes * 3;
    BufferPlan {
        elements: elements as usize,
        buffer_bytes,
        total_bytes,
        headroom_bytes: budget.saturating_sub(total_bytes),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VramCheck {
    pub config: VramConfig,
}

impl VramCheck {
    pub fn new(config: VramConfig) -> Self {
        Self { config }
    }
}

fn minutes(duration: Duration) -> f64 {
    duration.as_secs_f64() / 60.0
}

impl Check for VramCheck {
    fn title(&self) -> &'static str {
        "VRAM STRESS TEST"
    }

    fn instability_hint(&self) -> [&'static str; 2] {
        [
            "⚠️  VRAM instability detected",
            "   This GPU likely has memory issues",
        ]
    }

    fn execute<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
    ) -> Result<Tier> {
        let title = self.title();
        report.section("⚠️  This is the MOST IMPORTANT test!");
        report.line("⚠️  ANY errors = DO NOT BUY the GPU");
        report.blank();

        let info = ctx.device.info()?;
        ctx.device.release_cached()?;
        let memory = ctx.device.memory()?;
        let free_gb = memory.free_bytes as f64 / GB;
        report.line(format!("🔧 GPU: {}", info.name));
        report.line(format!("📊 Total VRAM: {:.2} GB", memory.total_bytes as f64 / GB));
        report.line(format!(
            "📊 Currently used: {:.2} GB (this process), {:.2} GB (other processes)",
            memory.allocated_bytes as f64 / GB,
            memory.foreign_bytes() as f64 / GB
        ));
        report.line(format!("📊 Available: {free_gb:.2} GB"));

        let decision = choose_size(self.config.size, memory.free_bytes);
        match decision {
            SizeDecision::Reduced { requested, size } => {
                report.blank();
                report.note(format!(
                    "⚠️  Requested {requested}GB but only {free_gb:.2}GB available"
                ));
                report.note(format!("⚠️  Auto-adjusting test size to {size}GB"));
            }
            SizeDecision::Auto(size) => {
                report.note(format!("🎯 Auto-detected test size: {size} GB"));
            }
            SizeDecision::Requested(_) => {}
        }
        let size_gb = decision.size_gb();

        if memory.foreign_bytes() > FOREIGN_WARN_BYTES {
            report.blank();
            report.note(format!(
                "⚠️  WARNING: {:.2}GB VRAM already in use!",
                memory.foreign_bytes() as f64 / GB
            ));
            report.line("⚠️  Another process may be running. Consider:");
            report.line("   1. Run: nvidia-smi");
            report.line("   2. Stop other GPU processes");
            report.line("   3. Restart container/VM");
            report.line(format!("\n   Continuing with available VRAM ({size_gb}GB)..."));
        }

        let duration = self.config.duration;
        report.section(&format!("🎯 Test size: {size_gb} GB TOTAL"));
        report.line(format!("⏱️  Duration: {} minutes", minutes(duration)));
        report.rule();

        let plan = plan_buffers(size_gb);
        report.section("Allocating 3 buffers + headroom for auxiliary work:");
        report.line(format!(
            "  - Each buffer: {} elements ({:.2} GB)",
            plan.elements,
            plan.buffer_bytes as f64 / GB
        ));
        report.line(format!("  - Total allocation: ~{:.1} GB", plan.total_bytes as f64 / GB));
        report.line(format!("  - Headroom: ~{:.1} GB", plan.headroom_bytes as f64 / GB));

        report.section("1️⃣  Allocating VRAM...");
        let workload = Workload::Stress(StressPlan::vram(plan.elements, duration));
        let outcome = run_workload(ctx, &workload, &mut |event| match event {
            Progress::Allocated {
                label, total_bytes, ..
            } => {
                report.line(format!(
                    "   ✓ Allocated {label}: {:.2} GB",
                    *total_bytes as f64 / GB
                ));
            }
            Progress::Started { duration } => {
                report.section(&format!(
                    "2️⃣  Running stress test for {} minutes...",
                    minutes(*duration)
                ));
                report.line("   Press Ctrl+C to stop early");
                report.blank();
            }
            Progress::Iteration {
                iterations,
                elapsed,
                duration,
            } => {
                let remaining = duration.saturating_sub(*elapsed);
                report.line(format!(
                    "   [{:5.1}%] Iteration {iterations:5} | Elapsed: {:4.1}m | Remaining: {:4.1}m",
                    Progress::percent(*elapsed, *duration),
                    minutes(*elapsed),
                    minutes(remaining)
                ));
            }
            Progress::StepFailed { iterations, error } => {
                report.note(format!("   ❌ Error at iteration {iterations}: {error}"));
            }
            Progress::Temperature { .. } => {}
            Progress::Aborted { iterations } => {
                report.note(format!("   Iterations before failure: {iterations}"));
            }
        })?;

        let errors = outcome.errors;
        if outcome.interrupted {
            report.section("⚠️  Test interrupted by user");
            report.line(format!("   Completed {} iterations", outcome.iterations));
            report.line(format!("   Errors so far: {errors}"));
            if errors == 0 {
                report.verdict(
                    &format!("✅ {title}: PASS (partial)"),
                    &["✓ No errors detected before interruption"],
                );
                return Ok(Tier::Good);
            }
            report.verdict(
                &format!("❌ {title}: FAIL"),
                &[format!("❌ {errors} errors detected - DO NOT BUY!")],
            );
            return Ok(Tier::Fail);
        }

        report.section("3️⃣  Test completed!");
        report.line(format!("   Total iterations: {}", outcome.iterations));
        report.line(format!("   Errors detected: {errors}"));
        if errors == 0 {
            report.verdict(
                &format!("✅ {title}: PASS"),
                &["✅ 0 errors detected - VRAM is healthy"],
            );
            Ok(Tier::Good)
        } else {
            report.verdict(
                &format!("❌ {title}: FAIL"),
                &[format!("❌ {errors} errors detected - DO NOT BUY!")],
            );
            Ok(Tier::Fail)
        }
    }
}
