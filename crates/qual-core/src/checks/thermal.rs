use std::{io::Write, time::Duration};

use tracing::{debug, warn};

use crate::{
    checks::{Check, CheckContext},
    device::Accelerator,
    error::Result,
    grade::{ThresholdTable, Tier, grade},
    report::Reporter,
    workload::{Progress, StressPlan, TEMPERATURE, Workload, run_workload},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThermalConfig {
    pub duration: Duration,
    /// Peak temperature at or above which the card fails.
    pub limit_c: u32,
    pub matrix_size: usize,
    pub cooldown: Duration,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3 * 60),
            limit_c: 85,
            matrix_size: 8192,
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThermalCheck {
    pub config: ThermalConfig,
}

impl ThermalCheck {
    pub fn new(config: ThermalConfig) -> Self {
        Self { config }
    }
}

fn sample_status(tier: Tier) -> &'static str {
    match tier {
        Tier::Excellent => "✓ GOOD",
        Tier::Good => "⚠ WARM",
        Tier::Acceptable => "⚠ HOT",
        Tier::Fail => "❌ TOO HOT",
    }
}

/// Peak and mean of the recorded samples, `None` when nothing was recorded.
fn summarize(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let max = samples.iter().copied().fold(f64::MIN, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    Some((max, avg))
}

impl ThermalCheck {
    fn conclude<W: Write>(
        &self,
        table: &ThresholdTable,
        peak: f64,
        advice: &str,
        report: &mut Reporter<W>,
    ) -> Tier {
        let title = self.title();
        let tier = grade(TEMPERATURE, peak, table);
        let bound = |tier| table.bound_for(tier).unwrap_or(f64::from(self.config.limit_c));
        match tier {
            Tier::Excellent => report.verdict(
                &format!("✅ {title}: EXCELLENT"),
                &[format!("✅ Cooling is very good (<{}°C)", bound(Tier::Excellent))],
            ),
            Tier::Good => report.verdict(
                &format!("✅ {title}: PASS"),
                &[format!("✅ Cooling is good (<{}°C)", bound(Tier::Good))],
            ),
            Tier::Acceptable => report.verdict(
                &format!("⚠️  {title}: WARNING"),
                &[
                    "⚠️  Temperature is high but acceptable".to_string(),
                    format!("⚠️  {advice}"),
                ],
            ),
            Tier::Fail => report.verdict(
                &format!("❌ {title}: FAIL"),
                &[
                    format!(
                        "❌ Temperature exceeded limit ({peak}°C >= {}°C)",
                        self.config.limit_c
                    ),
                    "❌ Cooling system may be inadequate".to_string(),
                ],
            ),
        }
        tier
    }
}

impl Check for ThermalCheck {
    fn title(&self) -> &'static str {
        "THERMAL STRESS TEST"
    }

    fn execute<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
    ) -> Result<Tier> {
        let title = self.title();
        let cfg = &self.config;
        let info = ctx.device.info()?;
        let table = ctx.profile.thermal.table(cfg.limit_c);

        report.section(&format!("🔧 GPU: {}", info.name));
        report.line(format!("⏱️  Duration: {} minutes", cfg.duration.as_secs_f64() / 60.0));
        report.line(format!("🌡️  Temperature limit: {}°C GPU", cfg.limit_c));
        report.rule();

        match ctx.utility.temperature() {
            Ok(celsius) => report.section(&format!("📊 Starting temperature: {celsius}°C")),
            Err(err) => warn!("starting temperature unavailable: {err}"),
        }

        report.section("1️⃣  Creating thermal workload...");
        let size = cfg.matrix_size;
        let mut throttled = false;
        let workload = Workload::Stress(StressPlan::thermal(size, cfg.duration));
        let outcome = run_workload(ctx, &workload, &mut |event| match event {
            Progress::Allocated { .. } => {}
            Progress::Started { .. } => {
                report.line(format!("   ✓ Workload created ({size}x{size} matrices)"));
                report.section("2️⃣  Running thermal stress test...");
                report.line("   Monitoring temperature every 5 iterations");
                report.blank();
            }
            Progress::Temperature {
                celsius,
                elapsed,
                duration,
            } => {
                let tier = table.grade(f64::from(*celsius));
                throttled |= tier == Tier::Fail;
                report.line(format!(
                    "   [{:5.1}%] Temp: {celsius:3}°C | {}",
                    Progress::percent(*elapsed, *duration),
                    sample_status(tier)
                ));
            }
            Progress::StepFailed { iterations, error } => {
                report.note(format!("   ❌ Error at iteration {iterations}: {error}"));
            }
            Progress::Iteration { .. } => {}
            Progress::Aborted { iterations } => {
                report.note(format!("   Iterations before failure: {iterations}"));
            }
        })?;

        let samples: Vec<f64> = outcome.values(TEMPERATURE).collect();
        let summary = summarize(&samples);
        debug!(samples = samples.len(), ?summary, "thermal samples collected");

        if outcome.interrupted {
            report.section("⚠️  Test interrupted by user");
            report.line(format!("   Completed {} iterations", outcome.iterations));
            report.line(format!("   Temperature samples: {}", samples.len()));
            if let Some((max, avg)) = summary {
                report.line(format!("   Max temperature: {max}°C"));
                report.line(format!("   Avg temperature: {avg:.1}°C"));
            }
            let over_limit = summary.is_some_and(|(max, _)| table.grade(max) == Tier::Fail);
            if outcome.errors == 0 && !over_limit {
                report.verdict(
                    &format!("✅ {title}: PASS (partial)"),
                    &["✓ No errors or over-limit readings before interruption"],
                );
                return Ok(Tier::Good);
            }
            let reason = if outcome.errors > 0 {
                format!("❌ {} errors detected during the run", outcome.errors)
            } else {
                format!("❌ Temperature reached the {}°C limit", cfg.limit_c)
            };
            report.verdict(&format!("❌ {title}: FAIL"), &[reason]);
            return Ok(Tier::Fail);
        }

        report.section("3️⃣  Test completed!");
        report.line(format!("   Iterations: {}", outcome.iterations));

        let tier = match summary {
            None => {
                report.verdict(
                    &format!("⚠️  {title}: WARNING"),
                    &["⚠️  No temperature readings; cooling could not be verified"],
                );
                Tier::Acceptable
            }
            Some((max, avg)) => {
                report.line(format!("   Max temperature: {max}°C"));
                report.line(format!("   Avg temperature: {avg:.1}°C"));
                let tier = self.conclude(&table, max, &ctx.profile.advice.thermal_warning, report);
                if throttled {
                    report.note("⚠️  Thermal throttling detected during test");
                }
                tier
            }
        };

        let tier = if outcome.errors > 0 {
            report.note(format!(
                "❌ {} runtime errors under load - THERMAL STRESS TEST: FAIL",
                outcome.errors
            ));
            Tier::Fail
        } else {
            tier
        };

        report.section(&format!(
            "🧊 Cooling down ({} seconds)...",
            cfg.cooldown.as_secs()
        ));
        ctx.clock.sleep(cfg.cooldown);
        if let Ok(celsius) = ctx.utility.temperature() {
            report.line(format!("   Final temperature: {celsius}°C"));
        }

        Ok(tier)
    }
}
