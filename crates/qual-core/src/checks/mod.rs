//! The four qualification checks and the boundary that runs them.
//!
//! - `info`: identity, capacity and link health.
//! - `performance`: FP32/FP16 matmul throughput and copy bandwidth.
//! - `vram`: time-boxed elementwise soak over most of the free memory.
//! - `thermal`: matmul heat soak with temperature sampling.
//!
//! [`run_check`] is the only place a [`CheckError`] turns into a verdict.

use std::io::Write;

use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    device::{Accelerator, GB},
    error::{CheckError, Result},
    grade::Tier,
    profile::DeviceProfile,
    report::{CheckResult, Reporter},
    signal::StopSignal,
    utility::DiagnosticUtility,
};

pub mod info;
pub mod performance;
pub mod thermal;
pub mod vram;

pub use info::InfoCheck;
pub use performance::{PerfConfig, PerformanceCheck};
pub use thermal::{ThermalCheck, ThermalConfig};
pub use vram::{SizeDecision, VramCheck, VramConfig, VramSize, choose_size};

/// Everything a check needs from the outside world, passed explicitly.
pub struct CheckContext<'a, D: Accelerator> {
    pub device: &'a D,
    pub utility: &'a dyn DiagnosticUtility,
    pub clock: &'a dyn Clock,
    pub stop: StopSignal,
    pub profile: &'a DeviceProfile,
}

pub trait Check {
    /// Banner title, e.g. `VRAM STRESS TEST`.
    fn title(&self) -> &'static str;

    /// Whether the check allocates device memory worth announcing cleanup for.
    fn allocates(&self) -> bool {
        true
    }

    /// Heading and hint printed when the device fails partway through.
    fn instability_hint(&self) -> [&'static str; 2] {
        [
            "⚠️  GPU runtime failure",
            "   The GPU could not complete the workload reliably",
        ]
    }

    /// Run the check body, printing metrics and its own verdict block.
    fn execute<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
    ) -> Result<Tier>;
}

/// Probe → workload → grade → verdict for one check, with cleanup on every path.
pub fn run_check<C, D, W>(check: &C, ctx: &CheckContext<'_, D>, out: W) -> CheckResult
where
    C: Check,
    D: Accelerator,
    W: Write,
{
    let mut report = Reporter::new(out);
    report.header(check.title());

    let span = tracing::info_span!("check", name = check.title(), device = ctx.device.ordinal());
    let _guard = span.enter();

    let baseline = ctx.device.memory().ok().map(|usage| usage.allocated_bytes);
    let outcome = check.execute(ctx, &mut report);

    let tier = match outcome {
        Ok(tier) => tier,
        Err(err) => conclude_with_error(check, err, &mut report),
    };

    cleanup(check, ctx.device, baseline, &mut report);
    info!(tier = %tier, exit_code = tier.exit_code(), "check finished");
    report.finish(tier)
}

/// Report a device that could not even be opened.
pub fn report_unavailable<C: Check, W: Write>(check: &C, err: CheckError, out: W) -> CheckResult {
    let mut report = Reporter::new(out);
    report.header(check.title());
    let tier = conclude_with_error(check, err, &mut report);
    report.finish(tier)
}

fn conclude_with_error<C: Check, W: Write>(
    check: &C,
    err: CheckError,
    report: &mut Reporter<W>,
) -> Tier {
    let title = check.title();
    match &err {
        CheckError::DeviceUnavailable(_) => {
            error!("{err}");
            report.blank();
            report.note("❌ CUDA not available!");
            report.note(format!("   {err}"));
            report.verdict(&format!("❌ {title}: FAIL"), &[] as &[&str]);
            Tier::Fail
        }
        CheckError::OutOfMemory { .. } => {
            error!("{err}");
            report.blank();
            report.note("❌ RUNTIME ERROR!");
            report.note(format!("   Error: {err}"));
            report.section("⚠️  Out of memory error");
            for line in [
                "   This could indicate:",
                "   - Test size too large for available VRAM",
                "   - Another process is using VRAM",
                "   - Memory fragmentation",
            ] {
                report.line(line);
            }
            report.section("💡 To fix:");
            for line in [
                "   1. Run: nvidia-smi  (check what's using GPU)",
                "   2. Stop other GPU processes",
                "   3. Run again with smaller size: --size 10",
                "   4. Or use auto size: --size auto",
            ] {
                report.note(line);
            }
            report.verdict(&format!("❌ {title}: FAIL"), &[] as &[&str]);
            Tier::Fail
        }
        CheckError::RuntimeInstability(_) => {
            error!("{err}");
            report.blank();
            report.note("❌ RUNTIME ERROR!");
            report.note(format!("   Error: {err}"));
            let [heading, hint] = check.instability_hint();
            report.section(heading);
            report.note(hint);
            report.verdict(&format!("❌ {title}: FAIL"), &[] as &[&str]);
            Tier::Fail
        }
        CheckError::UtilityUnavailable(_) => {
            warn!("{err}");
            report.blank();
            report.note(format!("⚠️  {err}"));
            report.verdict(
                &format!("⚠️  {title}: WARNING"),
                &["⚠️  Diagnostic data incomplete; results could not be fully verified"],
            );
            Tier::Acceptable
        }
        CheckError::UserInterrupted { iterations } => {
            warn!("{err}");
            report.blank();
            report.note("⚠️  Test interrupted by user");
            report.note(format!("   Stopped after {iterations} iterations"));
            report.verdict(&format!("✅ {title}: PASS (partial)"), &[] as &[&str]);
            Tier::Good
        }
    }
}

fn cleanup<C: Check, D: Accelerator, W: Write>(
    check: &C,
    device: &D,
    baseline: Option<u64>,
    report: &mut Reporter<W>,
) {
    if check.allocates() {
        report.section("🧹 Cleaning up VRAM...");
    }
    if let Err(err) = device.release_cached() {
        warn!("failed to release cached device memory: {err}");
    }
    match (baseline, device.memory()) {
        (Some(before), Ok(after)) if after.allocated_bytes > before => {
            let leaked = (after.allocated_bytes - before) as f64 / GB;
            warn!(leaked_gb = leaked, "device memory still held after cleanup");
            report.note(format!("   ⚠️  {leaked:.2} GB still allocated after cleanup"));
        }
        _ => {
            if check.allocates() {
                report.line("   ✓ VRAM cleaned");
            }
        }
    }
}
