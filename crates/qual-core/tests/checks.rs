use std::{cell::Cell, time::Duration};

use qual_core::{
    Accelerator, CannedUtility, Check, CheckContext, CheckError, CheckResult, DeviceInfo,
    DeviceProfile, DiagnosticUtility, ManualClock, MemoryUsage, Precision, StopSignal, Tier,
    checks::{
        InfoCheck, PerfConfig, PerformanceCheck, ThermalCheck, ThermalConfig, VramCheck,
        VramConfig, VramSize, report_unavailable, run_check,
    },
    device::probe,
    sim::{SimBuffer, SimRates, SimulatedDevice},
    utility::PcieLink,
};

const MINUTE: Duration = Duration::from_secs(60);

fn run<C: Check, D: Accelerator>(
    check: &C,
    device: &D,
    utility: &dyn DiagnosticUtility,
    clock: &ManualClock,
    stop: StopSignal,
) -> (CheckResult, String) {
    let profile = DeviceProfile::rtx_3090();
    let ctx = CheckContext {
        device,
        utility,
        clock,
        stop,
        profile: &profile,
    };
    let mut out = Vec::new();
    let result = run_check(check, &ctx, &mut out);
    (result, String::from_utf8(out).unwrap())
}

fn device_with_rates(clock: &ManualClock, fp32: f64, fp16: f64, bandwidth: f64) -> SimulatedDevice {
    SimulatedDevice::rtx_3090(clock.clone()).with_rates(SimRates {
        fp32_tflops: fp32,
        fp16_tflops: fp16,
        bandwidth_gbs: bandwidth,
    })
}

fn perf(fp32: f64, fp16: f64, bandwidth: f64) -> (CheckResult, String) {
    let clock = ManualClock::new();
    let device = device_with_rates(&clock, fp32, fp16, bandwidth);
    let result = run(
        &PerformanceCheck::default(),
        &device,
        &CannedUtility::healthy(),
        &clock,
        StopSignal::new(),
    );
    assert_eq!(device.allocated_bytes(), 0);
    result
}

/// Raises the stop signal once a given number of temperature reads happened,
/// the way a Ctrl+C handler would mid-run.
struct InterruptingUtility {
    inner: CannedUtility,
    stop: StopSignal,
    after_reads: usize,
}

impl DiagnosticUtility for InterruptingUtility {
    fn temperature(&self) -> qual_core::Result<u32> {
        let reading = self.inner.temperature();
        if self.inner.temperature_reads() >= self.after_reads {
            self.stop.raise();
        }
        reading
    }

    fn driver_version(&self) -> qual_core::Result<String> {
        self.inner.driver_version()
    }

    fn pcie_link(&self) -> qual_core::Result<PcieLink> {
        self.inner.pcie_link()
    }
}

/// Forwards to a simulated device and raises the stop signal mid-run: once
/// `after_matmuls` products have been issued, or on the first failed stress
/// step when `on_step_failure` is set.
struct InterruptingDevice {
    inner: SimulatedDevice,
    stop: StopSignal,
    after_matmuls: Option<u64>,
    on_step_failure: bool,
    matmuls: Cell<u64>,
}

impl InterruptingDevice {
    fn new(inner: SimulatedDevice, stop: &StopSignal) -> Self {
        Self {
            inner,
            stop: stop.clone(),
            after_matmuls: None,
            on_step_failure: false,
            matmuls: Cell::new(0),
        }
    }
}

impl Accelerator for InterruptingDevice {
    type Buffer = SimBuffer;

    fn ordinal(&self) -> usize {
        self.inner.ordinal()
    }

    fn info(&self) -> qual_core::Result<DeviceInfo> {
        self.inner.info()
    }

    fn memory(&self) -> qual_core::Result<MemoryUsage> {
        self.inner.memory()
    }

    fn alloc_random(
        &self,
        len: usize,
        precision: Precision,
        seed: u64,
    ) -> qual_core::Result<SimBuffer> {
        self.inner.alloc_random(len, precision, seed)
    }

    fn alloc_zeros(&self, len: usize, precision: Precision) -> qual_core::Result<SimBuffer> {
        self.inner.alloc_zeros(len, precision)
    }

    fn matmul(
        &self,
        a: &SimBuffer,
        b: &SimBuffer,
        out: &mut SimBuffer,
        n: usize,
    ) -> qual_core::Result<()> {
        let result = self.inner.matmul(a, b, out, n);
        self.matmuls.set(self.matmuls.get() + 1);
        if self.after_matmuls.is_some_and(|after| self.matmuls.get() >= after) {
            self.stop.raise();
        }
        result
    }

    fn copy(&self, src: &SimBuffer, dst: &mut SimBuffer) -> qual_core::Result<()> {
        self.inner.copy(src, dst)
    }

    fn stress_step(
        &self,
        a: &SimBuffer,
        b: &SimBuffer,
        out: &mut SimBuffer,
    ) -> qual_core::Result<()> {
        let result = self.inner.stress_step(a, b, out);
        if self.on_step_failure && result.is_err() {
            self.stop.raise();
        }
        result
    }

    fn synchronize(&self) -> qual_core::Result<()> {
        self.inner.synchronize()
    }

    fn release_cached(&self) -> qual_core::Result<()> {
        self.inner.release_cached()
    }
}

/// Warmup plus timed FP32 products with the default benchmark shape.
const FP32_MATMULS: u64 = 5 + 20;

#[test]
fn benchmarks_at_or_above_good_pass() {
    let (result, out) = perf(26.0, 80.0, 650.0);
    assert_eq!(result.tier, Tier::Good);
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("PERFORMANCE TEST: PASS"));
    assert!(out.contains("PERFORMANCE SUMMARY"));
    assert!(out.contains("✓ GOOD (≥25 TFLOPS)"));
}

#[test]
fn benchmarks_in_acceptable_band_warn_with_advice() {
    let (result, _) = perf(22.0, 65.0, 450.0);
    assert_eq!(result.tier, Tier::Acceptable);
    assert_eq!(result.exit_code, 2);
    assert!(result.mentions("Negotiate price down"));
}

#[test]
fn slow_fp32_fails_with_itemized_reason() {
    let (result, out) = perf(15.0, 95.0, 850.0);
    assert_eq!(result.tier, Tier::Fail);
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("FP32: 15.0 TFLOPS (expected >= 20)"));
    assert!(!result.mentions("FP16:"));
    assert!(out.contains("❌ LOW (<20 TFLOPS)"));
}

#[test]
fn excellent_card_reports_excellent() {
    let (result, _) = perf(29.0, 95.0, 850.0);
    assert_eq!(result.tier, Tier::Excellent);
    assert!(result.mentions("PASS (Excellent)"));
}

#[test]
fn benchmark_that_cannot_allocate_fails_cleanly() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_foreign_usage(25_500_000_000);
    let check = PerformanceCheck::new(PerfConfig::default());
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 1);
    assert!(out.contains("Out of memory error"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn vram_request_larger_than_free_memory_is_reduced() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_foreign_usage(15_769_803_776);
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(20),
    });
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());

    assert!(result.mentions("Auto-adjusting test size to 7GB"));
    assert!(result.mentions("already in use"));
    assert!(out.contains("🎯 Test size: 7 GB TOTAL"));
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("VRAM STRESS TEST: PASS"));
    assert!(device.peak_allocated_bytes() <= 7_000_000_000);
    assert_eq!(device.allocated_bytes(), 0);
    assert!(out.contains("✓ VRAM cleaned"));
}

#[test]
fn vram_auto_size_uses_seventy_percent_of_free() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Auto,
    });
    let (result, _) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert!(result.mentions("Auto-detected test size: 18 GB"));
    assert_eq!(result.exit_code, 0);
}

#[test]
fn vram_runtime_errors_mean_do_not_buy() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_step_fault_every(500);
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(8),
    });
    let (result, _) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.tier, Tier::Fail);
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("Error at iteration"));
    assert!(result.mentions("DO NOT BUY"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn vram_out_of_memory_fails_and_releases_partial_allocations() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_foreign_usage(22_769_803_776);
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(4),
    });
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("Run again with smaller size"));
    assert!(out.contains("✓ Allocated buffer A"));
    assert!(device.peak_allocated_bytes() > 0);
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn vram_interrupted_without_errors_passes_partially() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let stop = StopSignal::new();
    stop.raise();
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(8),
    });
    let (result, _) = run(&check, &device, &CannedUtility::healthy(), &clock, stop);
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("PASS (partial)"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn thermal_interrupted_after_three_samples_passes_partially() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let stop = StopSignal::new();
    let utility = InterruptingUtility {
        inner: CannedUtility::healthy(),
        stop: stop.clone(),
        // one starting read plus three samples
        after_reads: 4,
    };
    let (result, out) = run(&ThermalCheck::default(), &device, &utility, &clock, stop);

    assert_eq!(result.tier, Tier::Good);
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("THERMAL STRESS TEST: PASS (partial)"));
    assert!(out.contains("Temperature samples: 3"));
    assert!(!out.contains("Cooling down"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn thermal_full_run_with_cool_card_is_excellent() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let (result, out) = run(
        &ThermalCheck::default(),
        &device,
        &CannedUtility::healthy(),
        &clock,
        StopSignal::new(),
    );
    assert_eq!(result.tier, Tier::Excellent);
    assert_eq!(result.exit_code, 0);
    assert!(out.contains("Max temperature: 72°C"));
    assert!(out.contains("Final temperature: 72°C"));
    assert!(clock_past(&clock, 3 * 60 + 10));
}

fn clock_past(clock: &ManualClock, secs: u64) -> bool {
    use qual_core::Clock;
    clock.now() >= Duration::from_secs(secs)
}

#[test]
fn thermal_hot_card_warns_with_advice() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let utility = CannedUtility::healthy().with_temperatures([45, 70, 78, 82, 83]);
    let (result, _) = run(&ThermalCheck::default(), &device, &utility, &clock, StopSignal::new());
    assert_eq!(result.tier, Tier::Acceptable);
    assert_eq!(result.exit_code, 2);
    assert!(result.mentions("thermal pad replacement"));
}

#[test]
fn thermal_over_limit_fails_and_flags_throttling() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let utility = CannedUtility::healthy().with_temperatures([50, 80, 86, 84]);
    let check = ThermalCheck::new(ThermalConfig {
        limit_c: 85,
        ..ThermalConfig::default()
    });
    let (result, out) = run(&check, &device, &utility, &clock, StopSignal::new());
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("Thermal throttling detected"));
    assert!(out.contains("❌ TOO HOT"));
}

#[test]
fn thermal_without_readings_is_a_warning() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let check = ThermalCheck::new(ThermalConfig {
        duration: MINUTE,
        ..ThermalConfig::default()
    });
    let (result, _) = run(&check, &device, &CannedUtility::unavailable(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 2);
    assert!(result.mentions("cooling could not be verified"));
}

#[test]
fn info_on_healthy_card_passes() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let (result, out) = run(&InfoCheck, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 0);
    assert!(out.contains("✓ Correct model detected"));
    assert!(out.contains("Driver: 550.54.14"));
    assert!(out.contains("Gen 4 x16"));
    assert!(!out.contains("Cleaning up"));
}

#[test]
fn info_degrades_gracefully_without_the_utility() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone());
    let (result, out) = run(
        &InfoCheck,
        &device,
        &CannedUtility::unavailable(),
        &clock,
        StopSignal::new(),
    );
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("Could not read temperature"));
    assert!(result.mentions("Could not read PCIe info"));
    assert!(out.contains("Driver: Unknown"));
}

#[test]
fn info_fails_on_small_card() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::new(
        DeviceInfo {
            name: "NVIDIA GeForce RTX 3080".into(),
            total_memory_bytes: 10_737_418_240,
            compute_major: 8,
            compute_minor: 6,
            driver_version: None,
        },
        clock.clone(),
    );
    let (result, _) = run(&InfoCheck, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("Expected RTX 3090"));
    assert!(result.mentions("expected >= 23.5"));
}

#[test]
fn missing_device_fails() {
    let mut out = Vec::new();
    let result = report_unavailable(
        &InfoCheck,
        CheckError::DeviceUnavailable("no CUDA-capable device is detected".into()),
        &mut out,
    );
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("CUDA not available"));
}

#[test]
fn probing_twice_gives_the_same_answer() {
    let device = SimulatedDevice::rtx_3090(ManualClock::new());
    let utility = CannedUtility::healthy();
    let first = probe(&device, &utility).unwrap();
    let second = probe(&device, &utility).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.driver_version.as_deref(), Some("550.54.14"));
    assert_eq!(device.memory().unwrap().allocated_bytes, 0);
}

#[test]
fn benchmark_interrupted_after_failing_fp32_fails() {
    let clock = ManualClock::new();
    let stop = StopSignal::new();
    let device = InterruptingDevice {
        after_matmuls: Some(FP32_MATMULS),
        ..InterruptingDevice::new(device_with_rates(&clock, 10.0, 95.0, 850.0), &stop)
    };
    let (result, out) = run(
        &PerformanceCheck::default(),
        &device,
        &CannedUtility::healthy(),
        &clock,
        stop,
    );
    assert_eq!(result.tier, Tier::Fail);
    assert_eq!(result.exit_code, 1);
    assert!(result.mentions("PERFORMANCE BENCHMARK: FAIL"));
    assert!(result.mentions("FP32: 10.0 TFLOPS (expected >= 20)"));
    assert!(out.contains("Completed 1 of 3 benchmarks"));
    assert!(!out.contains("PERFORMANCE SUMMARY"));
    assert!(out.contains("✓ VRAM cleaned"));
    assert_eq!(device.inner.allocated_bytes(), 0);
}

#[test]
fn benchmark_interrupted_after_good_fp32_passes_partially() {
    let clock = ManualClock::new();
    let stop = StopSignal::new();
    let device = InterruptingDevice {
        after_matmuls: Some(FP32_MATMULS),
        ..InterruptingDevice::new(device_with_rates(&clock, 26.0, 95.0, 850.0), &stop)
    };
    let (result, _) = run(
        &PerformanceCheck::default(),
        &device,
        &CannedUtility::healthy(),
        &clock,
        stop,
    );
    assert_eq!(result.tier, Tier::Good);
    assert_eq!(result.exit_code, 0);
    assert!(result.mentions("PERFORMANCE BENCHMARK: PASS (partial)"));
}

#[test]
fn benchmark_runtime_failure_is_not_blamed_on_vram() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_matmul_fault_every(1);
    let (result, out) = run(
        &PerformanceCheck::default(),
        &device,
        &CannedUtility::healthy(),
        &clock,
        StopSignal::new(),
    );
    assert_eq!(result.exit_code, 1);
    assert!(out.contains("GPU runtime failure"));
    assert!(!out.contains("VRAM instability"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn vram_interrupted_after_a_fault_means_do_not_buy() {
    let clock = ManualClock::new();
    let stop = StopSignal::new();
    let device = InterruptingDevice {
        on_step_failure: true,
        ..InterruptingDevice::new(
            SimulatedDevice::rtx_3090(clock.clone()).with_step_fault_every(3),
            &stop,
        )
    };
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(8),
    });
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, stop);
    assert_eq!(result.tier, Tier::Fail);
    assert_eq!(result.exit_code, 1);
    assert!(out.contains("Test interrupted by user"));
    assert!(out.contains("Errors so far: 1"));
    assert!(result.mentions("DO NOT BUY"));
    assert_eq!(device.inner.allocated_bytes(), 0);
}

#[test]
fn vram_out_of_memory_mid_run_reports_iterations() {
    let clock = ManualClock::new();
    // leaves room for the three buffers but not the auxiliary matmul
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_foreign_usage(22_519_803_776);
    let check = VramCheck::new(VramConfig {
        duration: MINUTE,
        size: VramSize::Gigabytes(4),
    });
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.exit_code, 1);
    assert!(out.contains("Running stress test"));
    assert!(result.mentions("Iterations before failure: 0"));
    assert!(result.mentions("Run again with smaller size"));
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn thermal_runtime_errors_fail_the_check() {
    let clock = ManualClock::new();
    let device = SimulatedDevice::rtx_3090(clock.clone()).with_matmul_fault_every(150);
    let check = ThermalCheck::new(ThermalConfig {
        duration: MINUTE,
        ..ThermalConfig::default()
    });
    let (result, out) = run(&check, &device, &CannedUtility::healthy(), &clock, StopSignal::new());
    assert_eq!(result.tier, Tier::Fail);
    assert_eq!(result.exit_code, 1);
    assert!(out.contains("Error at iteration"));
    assert!(result.mentions("runtime errors under load"));
    assert_eq!(device.allocated_bytes(), 0);
}
