use std::io::Write;

use qual_core::{
    Accelerator, CannedUtility, CheckContext, CheckError, CheckResult, Clock, DiagnosticUtility,
    ManualClock, Reporter, StopSignal, Tier,
    checks::{InfoCheck, PerformanceCheck, ThermalCheck, VramCheck, report_unavailable, run_check},
    sim::SimulatedDevice,
};
use tracing::{info, warn};

use crate::config::{QualifyConfig, Selection};

/// One check in the run order. `Check` is generic over the device, so the
/// list is an enum rather than trait objects.
enum Step {
    Info(InfoCheck),
    Performance(PerformanceCheck),
    Vram(VramCheck),
    Thermal(ThermalCheck),
}

impl Step {
    fn title(&self) -> &'static str {
        use qual_core::Check;
        match self {
            Step::Info(check) => check.title(),
            Step::Performance(check) => check.title(),
            Step::Vram(check) => check.title(),
            Step::Thermal(check) => check.title(),
        }
    }

    fn run<D: Accelerator, W: Write>(&self, ctx: &CheckContext<'_, D>, out: W) -> CheckResult {
        match self {
            Step::Info(check) => run_check(check, ctx, out),
            Step::Performance(check) => run_check(check, ctx, out),
            Step::Vram(check) => run_check(check, ctx, out),
            Step::Thermal(check) => run_check(check, ctx, out),
        }
    }

    fn unavailable<W: Write>(&self, err: CheckError, out: W) -> CheckResult {
        match self {
            Step::Info(check) => report_unavailable(check, err, out),
            Step::Performance(check) => report_unavailable(check, err, out),
            Step::Vram(check) => report_unavailable(check, err, out),
            Step::Thermal(check) => report_unavailable(check, err, out),
        }
    }
}

fn steps(selection: &Selection) -> Vec<Step> {
    match selection {
        Selection::Info => vec![Step::Info(InfoCheck)],
        Selection::Performance => vec![Step::Performance(PerformanceCheck::default())],
        Selection::Vram(config) => vec![Step::Vram(VramCheck::new(*config))],
        Selection::Thermal(config) => vec![Step::Thermal(ThermalCheck::new(*config))],
        Selection::All { vram, thermal } => vec![
            Step::Info(InfoCheck),
            Step::Performance(PerformanceCheck::default()),
            Step::Vram(VramCheck::new(*vram)),
            Step::Thermal(ThermalCheck::new(*thermal)),
        ],
    }
}

/// Run the selected checks and return the worst tier.
pub(crate) fn run<W: Write>(config: &QualifyConfig, stop: StopSignal, out: &mut W) -> Tier {
    if config.simulate {
        info!("running against a simulated RTX 3090");
        let clock = ManualClock::new();
        let device = SimulatedDevice::rtx_3090(clock.clone());
        let utility = CannedUtility::healthy();
        return run_on(config, &device, &utility, &clock, stop, out);
    }
    run_on_hardware(config, stop, out)
}

#[cfg(feature = "cuda")]
fn run_on_hardware<W: Write>(config: &QualifyConfig, stop: StopSignal, out: &mut W) -> Tier {
    use gpu_kernels::CudaAccelerator;
    use qual_core::{NvidiaSmi, SystemClock};

    match CudaAccelerator::open(config.device) {
        Ok(device) => {
            let utility = NvidiaSmi::new(config.device);
            let clock = SystemClock::new();
            run_on(config, &device, &utility, &clock, stop, out)
        }
        Err(err) => unavailable(config, err, out),
    }
}

#[cfg(not(feature = "cuda"))]
fn run_on_hardware<W: Write>(config: &QualifyConfig, _stop: StopSignal, out: &mut W) -> Tier {
    let err = CheckError::DeviceUnavailable(
        "built without the `cuda` feature; use --simulate or rebuild with CUDA".into(),
    );
    unavailable(config, err, out)
}

fn unavailable<W: Write>(config: &QualifyConfig, err: CheckError, out: &mut W) -> Tier {
    match steps(&config.selection).first() {
        Some(step) => step.unavailable(err, &mut *out).tier,
        None => Tier::Fail,
    }
}

fn run_on<D, W>(
    config: &QualifyConfig,
    device: &D,
    utility: &dyn DiagnosticUtility,
    clock: &dyn Clock,
    stop: StopSignal,
    out: &mut W,
) -> Tier
where
    D: Accelerator,
    W: Write,
{
    let ctx = CheckContext {
        device,
        utility,
        clock,
        stop,
        profile: &config.profile,
    };

    let steps = steps(&config.selection);
    let mut results: Vec<(&'static str, Option<CheckResult>)> = Vec::new();
    for step in &steps {
        if !results.is_empty() && ctx.stop.is_raised() {
            warn!(check = step.title(), "skipped after interruption");
            results.push((step.title(), None));
            continue;
        }
        let result = step.run(&ctx, &mut *out);
        let _ = writeln!(out);
        results.push((step.title(), Some(result)));
    }

    // A skipped check verified nothing, so the run can at best warn.
    let worst = results
        .iter()
        .map(|(_, result)| result.as_ref().map_or(Tier::Acceptable, |result| result.tier))
        .min()
        .unwrap_or(Tier::Fail);

    if results.len() > 1 {
        let mut report = Reporter::new(&mut *out);
        report.banner("QUALIFICATION SUMMARY");
        for (title, result) in &results {
            let status = result
                .as_ref()
                .map_or("SKIPPED", |result| result.tier.label());
            report.line(format!("{title:<24} {status}"));
        }
        report.rule();
        report.line(format!("Overall: {} (exit code {})", worst.label(), worst.exit_code()));
    }
    worst
}
