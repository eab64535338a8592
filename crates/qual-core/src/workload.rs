//! Device workloads that turn buffers and arithmetic into measurements.
//!
//! Every buffer a workload allocates is a local owned by the function that
//! allocated it, so all of them are released on every exit path, including
//! early returns through `?`.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    checks::CheckContext,
    device::{Accelerator, DeviceBuffer, Precision},
    error::{CheckError, Result},
};

const SEED_A: u64 = 0x5eed_000a;
const SEED_B: u64 = 0x5eed_000b;
const SEED_AUX: u64 = 0x5eed_0a0c;

/// Metric name under which stress loops record temperature samples.
pub const TEMPERATURE: &str = "Temperature";

/// One recorded observation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Measurement {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    /// Offset from the check clock's origin.
    pub at: Duration,
}

impl Measurement {
    pub fn new(metric: &str, value: f64, unit: &str, at: Duration) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
            at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeParams {
    /// Edge length of the square matrices.
    pub size: usize,
    pub precision: Precision,
    pub warmup: u32,
    pub iterations: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandwidthParams {
    /// Size of the buffer copied on every iteration.
    pub bytes: u64,
    pub warmup: u32,
    pub iterations: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressStep {
    /// `out = sqrt(|2(a + b)|)` over three FP32 buffers of `elements` each.
    Elementwise { elements: usize },
    /// `r1 = a·b; r2 = r1·b`, `repeats` times per iteration.
    Matmul { size: usize, repeats: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StressPlan {
    pub step: StressStep,
    /// Wall-clock budget; the loop stops at the first iteration boundary past it.
    pub duration: Duration,
    /// Run an auxiliary `aux_size²` matmul every this many iterations.
    pub aux_every: Option<u64>,
    pub aux_size: usize,
    /// Read the temperature every this many iterations.
    pub poll_every: Option<u64>,
    /// Emit [`Progress::Iteration`] every this many iterations.
    pub progress_every: Option<u64>,
    /// Sleep for `pace` every `pace_every` iterations.
    pub pace_every: Option<u64>,
    pub pace: Duration,
    /// Give up after this many failed steps in a row.
    pub max_consecutive_errors: u64,
}

impl StressPlan {
    /// Elementwise VRAM soak over three buffers of `elements` FP32 values.
    pub fn vram(elements: usize, duration: Duration) -> Self {
        Self {
            step: StressStep::Elementwise { elements },
            duration,
            aux_every: Some(10),
            aux_size: 4000,
            poll_every: None,
            progress_every: Some(100),
            pace_every: Some(10),
            pace: Duration::from_millis(50),
            max_consecutive_errors: 100,
        }
    }

    /// Matmul-heavy heat soak with temperature sampling.
    pub fn thermal(size: usize, duration: Duration) -> Self {
        Self {
            step: StressStep::Matmul { size, repeats: 50 },
            duration,
            aux_every: None,
            aux_size: 0,
            poll_every: Some(5),
            progress_every: None,
            pace_every: None,
            pace: Duration::ZERO,
            max_consecutive_errors: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    Compute(ComputeParams),
    Bandwidth(BandwidthParams),
    Stress(StressPlan),
}

/// Events surfaced while a workload runs, for the reporter to print.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    Allocated {
        label: &'static str,
        bytes: u64,
        total_bytes: u64,
    },
    Started {
        duration: Duration,
    },
    Iteration {
        iterations: u64,
        elapsed: Duration,
        duration: Duration,
    },
    Temperature {
        celsius: u32,
        elapsed: Duration,
        duration: Duration,
    },
    StepFailed {
        iterations: u64,
        error: CheckError,
    },
    /// The loop hit out-of-memory and is about to abort.
    Aborted {
        iterations: u64,
    },
}

impl Progress {
    /// Share of the time budget used so far, in percent.
    pub fn percent(elapsed: Duration, duration: Duration) -> f64 {
        if duration.is_zero() {
            return 100.0;
        }
        (elapsed.as_secs_f64() / duration.as_secs_f64() * 100.0).min(100.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadOutcome {
    pub measurements: Vec<Measurement>,
    /// Timed iterations for benchmarks, completed loop iterations for stress runs.
    pub iterations: u64,
    /// Failed steps, excluding out-of-memory which aborts the workload.
    pub errors: u64,
    pub interrupted: bool,
    /// Timed span for benchmarks, loop span for stress runs.
    pub elapsed: Duration,
}

impl WorkloadOutcome {
    pub fn values<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.measurements
            .iter()
            .filter(move |measurement| measurement.metric == metric)
            .map(|measurement| measurement.value)
    }

    pub fn first(&self, metric: &str) -> Option<f64> {
        self.values(metric).next()
    }
}

pub fn run_workload<D: Accelerator>(
    ctx: &CheckContext<'_, D>,
    workload: &Workload,
    progress: &mut dyn FnMut(&Progress),
) -> Result<WorkloadOutcome> {
    match workload {
        Workload::Compute(params) => run_compute(ctx, params),
        Workload::Bandwidth(params) => run_bandwidth(ctx, params),
        Workload::Stress(plan) => run_stress(ctx, plan, progress),
    }
}

fn run_compute<D: Accelerator>(
    ctx: &CheckContext<'_, D>,
    params: &ComputeParams,
) -> Result<WorkloadOutcome> {
    let device = ctx.device;
    let n = params.size;
    let elements = n * n;
    let a = device.alloc_random(elements, params.precision, SEED_A)?;
    let b = device.alloc_random(elements, params.precision, SEED_B)?;
    let mut c = device.alloc_zeros(elements, params.precision)?;

    for _ in 0..params.warmup {
        device.matmul(&a, &b, &mut c, n)?;
    }
    device.synchronize()?;

    let start = ctx.clock.now();
    for done in 0..params.iterations {
        interrupted(ctx, done)?;
        device.matmul(&a, &b, &mut c, n)?;
    }
    device.synchronize()?;
    let end = ctx.clock.now();
    let elapsed = end.saturating_sub(start);

    let flops = 2.0 * (n as f64).powi(3) * f64::from(params.iterations);
    let tflops = rate(flops, elapsed)? / 1e12;
    debug!(
        precision = params.precision.label(),
        size = n,
        iterations = params.iterations,
        elapsed_s = elapsed.as_secs_f64(),
        tflops,
        "matmul benchmark"
    );

    Ok(WorkloadOutcome {
        measurements: vec![Measurement::new(
            params.precision.label(),
            tflops,
            "TFLOPS",
            end,
        )],
        iterations: u64::from(params.iterations),
        errors: 0,
        interrupted: false,
        elapsed,
    })
}

fn run_bandwidth<D: Accelerator>(
    ctx: &CheckContext<'_, D>,
    params: &BandwidthParams,
) -> Result<WorkloadOutcome> {
    let device = ctx.device;
    let elements = (params.bytes / Precision::F32.size_bytes() as u64) as usize;
    let src = device.alloc_random(elements, Precision::F32, SEED_A)?;
    let mut dst = device.alloc_zeros(elements, Precision::F32)?;

    for _ in 0..params.warmup {
        device.copy(&src, &mut dst)?;
    }
    device.synchronize()?;

    let start = ctx.clock.now();
    for done in 0..params.iterations {
        interrupted(ctx, done)?;
        device.copy(&src, &mut dst)?;
    }
    device.synchronize()?;
    let end = ctx.clock.now();
    let elapsed = end.saturating_sub(start);

    let moved = src.size_bytes() as f64 * f64::from(params.iterations);
    let gbs = rate(moved, elapsed)? / 1e9;
    debug!(
        bytes = src.size_bytes(),
        iterations = params.iterations,
        elapsed_s = elapsed.as_secs_f64(),
        gbs,
        "copy benchmark"
    );

    Ok(WorkloadOutcome {
        measurements: vec![Measurement::new("Bandwidth", gbs, "GB/s", end)],
        iterations: u64::from(params.iterations),
        errors: 0,
        interrupted: false,
        elapsed,
    })
}

/// A stop request ends a benchmark with an error; the check grades the
/// benchmarks that finished before it.
fn interrupted<D: Accelerator>(ctx: &CheckContext<'_, D>, done: u32) -> Result<()> {
    if ctx.stop.is_raised() {
        return Err(CheckError::UserInterrupted {
            iterations: u64::from(done),
        });
    }
    Ok(())
}

fn rate(amount: f64, elapsed: Duration) -> Result<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return Err(CheckError::RuntimeInstability(
            "benchmark completed in zero measurable time".into(),
        ));
    }
    Ok(amount / secs)
}

fn announce<B: DeviceBuffer>(
    progress: &mut dyn FnMut(&Progress),
    label: &'static str,
    buffer: &B,
    total_bytes: &mut u64,
) {
    *total_bytes += buffer.size_bytes();
    progress(&Progress::Allocated {
        label,
        bytes: buffer.size_bytes(),
        total_bytes: *total_bytes,
    });
}

fn run_stress<D: Accelerator>(
    ctx: &CheckContext<'_, D>,
    plan: &StressPlan,
    progress: &mut dyn FnMut(&Progress),
) -> Result<WorkloadOutcome> {
    let device = ctx.device;
    let mut total = 0;
    match plan.step {
        StressStep::Elementwise { elements } => {
            let a = device.alloc_random(elements, Precision::F32, SEED_A)?;
            announce(progress, "buffer A", &a, &mut total);
            let b = device.alloc_random(elements, Precision::F32, SEED_B)?;
            announce(progress, "buffer B", &b, &mut total);
            let mut out = device.alloc_zeros(elements, Precision::F32)?;
            announce(progress, "result buffer", &out, &mut total);

            stress_loop(ctx, plan, progress, |device: &D| {
                device.stress_step(&a, &b, &mut out)
            })
        }
        StressStep::Matmul { size, repeats } => {
            let elements = size * size;
            let a = device.alloc_random(elements, Precision::F32, SEED_A)?;
            announce(progress, "matrix A", &a, &mut total);
            let b = device.alloc_random(elements, Precision::F32, SEED_B)?;
            announce(progress, "matrix B", &b, &mut total);
            let mut first = device.alloc_zeros(elements, Precision::F32)?;
            announce(progress, "product buffer", &first, &mut total);
            let mut second = device.alloc_zeros(elements, Precision::F32)?;
            announce(progress, "chained product buffer", &second, &mut total);

            stress_loop(ctx, plan, progress, |device: &D| {
                for _ in 0..repeats {
                    device.matmul(&a, &b, &mut first, size)?;
                    device.matmul(&first, &b, &mut second, size)?;
                }
                Ok(())
            })
        }
    }
}

/// Allocate, multiply and release a small independent workload so the
/// allocator and access pattern do not settle into a fixed rhythm.
fn aux_workload<D: Accelerator>(device: &D, size: usize) -> Result<()> {
    {
        let elements = size * size;
        let a = device.alloc_random(elements, Precision::F32, SEED_AUX)?;
        let b = device.alloc_random(elements, Precision::F32, SEED_AUX ^ 1)?;
        let mut c = device.alloc_zeros(elements, Precision::F32)?;
        device.matmul(&a, &b, &mut c, size)?;
        device.synchronize()?;
    }
    device.release_cached()
}

/// Fold a step result into the outcome. Out-of-memory is the one error that
/// aborts the loop.
fn absorb(
    result: Result<()>,
    outcome: &mut WorkloadOutcome,
    consecutive: &mut u64,
    progress: &mut dyn FnMut(&Progress),
) -> Result<()> {
    match result {
        Ok(()) => {
            *consecutive = 0;
            Ok(())
        }
        Err(err) if err.is_out_of_memory() => {
            warn!(iterations = outcome.iterations, "stress loop aborted: {err}");
            progress(&Progress::Aborted {
                iterations: outcome.iterations,
            });
            Err(err)
        }
        Err(err) => {
            outcome.errors += 1;
            *consecutive += 1;
            warn!(iterations = outcome.iterations, "stress step failed: {err}");
            progress(&Progress::StepFailed {
                iterations: outcome.iterations,
                error: err,
            });
            Ok(())
        }
    }
}

fn every(period: Option<u64>, count: u64) -> bool {
    period.is_some_and(|period| period > 0 && count % period == 0)
}

fn stress_loop<D, F>(
    ctx: &CheckContext<'_, D>,
    plan: &StressPlan,
    progress: &mut dyn FnMut(&Progress),
    mut step: F,
) -> Result<WorkloadOutcome>
where
    D: Accelerator,
    F: FnMut(&D) -> Result<()>,
{
    let device = ctx.device;
    let clock = ctx.clock;
    let mut outcome = WorkloadOutcome::default();
    let mut consecutive = 0;
    let mut temperature_warned = false;

    progress(&Progress::Started {
        duration: plan.duration,
    });
    let start = clock.now();

    loop {
        if ctx.stop.is_raised() {
            outcome.interrupted = true;
            break;
        }
        if clock.now().saturating_sub(start) >= plan.duration {
            break;
        }

        let result = step(device).and_then(|()| device.synchronize());
        absorb(result, &mut outcome, &mut consecutive, progress)?;

        if every(plan.aux_every, outcome.iterations) {
            let result = aux_workload(device, plan.aux_size);
            absorb(result, &mut outcome, &mut consecutive, progress)?;
        }

        outcome.iterations += 1;
        let elapsed = clock.now().saturating_sub(start);

        if every(plan.poll_every, outcome.iterations) {
            match ctx.utility.temperature() {
                Ok(celsius) => {
                    outcome.measurements.push(Measurement::new(
                        TEMPERATURE,
                        f64::from(celsius),
                        "°C",
                        clock.now(),
                    ));
                    progress(&Progress::Temperature {
                        celsius,
                        elapsed,
                        duration: plan.duration,
                    });
                }
                Err(err) => {
                    if !temperature_warned {
                        warn!("temperature polling unavailable: {err}");
                        temperature_warned = true;
                    }
                }
            }
        }

        if every(plan.progress_every, outcome.iterations) {
            progress(&Progress::Iteration {
                iterations: outcome.iterations,
                elapsed,
                duration: plan.duration,
            });
        }

        if every(plan.pace_every, outcome.iterations) {
            clock.sleep(plan.pace);
        }

        if consecutive >= plan.max_consecutive_errors {
            warn!(consecutive, "too many consecutive failures; ending stress loop early");
            break;
        }
    }

    outcome.elapsed = clock.now().saturating_sub(start);
    debug!(
        iterations = outcome.iterations,
        errors = outcome.errors,
        interrupted = outcome.interrupted,
        samples = outcome.measurements.len(),
        "stress loop finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_helper() {
        assert!(every(Some(10), 0));
        assert!(every(Some(10), 20));
        assert!(!every(Some(10), 5));
        assert!(!every(None, 10));
        assert!(!every(Some(0), 10));
    }

    #[test]
    fn percent_is_capped() {
        let minute = Duration::from_secs(60);
        assert_eq!(Progress::percent(Duration::from_secs(30), minute), 50.0);
        assert_eq!(Progress::percent(Duration::from_secs(90), minute), 100.0);
        assert_eq!(Progress::percent(minute, Duration::ZERO), 100.0);
    }

    #[test]
    fn values_filter_by_metric() {
        let at = Duration::ZERO;
        let outcome = WorkloadOutcome {
            measurements: vec![
                Measurement::new(TEMPERATURE, 60.0, "°C", at),
                Measurement::new("FP32", 29.0, "TFLOPS", at),
                Measurement::new(TEMPERATURE, 64.0, "°C", at),
            ],
            ..WorkloadOutcome::default()
        };
        let metric = String::from(TEMPERATURE);
        assert_eq!(outcome.values(&metric).collect::<Vec<_>>(), [60.0, 64.0]);
        assert_eq!(outcome.first("FP32"), Some(29.0));
        assert_eq!(outcome.first("FP16"), None);
    }

    #[test]
    fn out_of_memory_aborts_and_reports_progress() {
        let mut outcome = WorkloadOutcome {
            iterations: 12,
            ..WorkloadOutcome::default()
        };
        let mut consecutive = 0;
        let mut events = Vec::new();
        let err = CheckError::OutOfMemory {
            requested_bytes: 64,
            detail: "full".into(),
        };
        let result = absorb(Err(err), &mut outcome, &mut consecutive, &mut |event| {
            events.push(event.clone())
        });
        assert!(result.is_err_and(|err| err.is_out_of_memory()));
        assert_eq!(events, [Progress::Aborted { iterations: 12 }]);
        assert_eq!(outcome.errors, 0);
    }

    #[test]
    fn zero_elapsed_is_rejected() {
        assert!(rate(1.0, Duration::ZERO).is_err());
        assert_eq!(rate(10.0, Duration::from_secs(2)).unwrap(), 5.0);
    }
}
