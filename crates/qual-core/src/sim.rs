//! Hardware-free accelerator used by tests and `--simulate` runs.
//!
//! Buffers carry no data; the device only does memory accounting and moves a
//! [`ManualClock`] forward by the time each operation would take at the
//! configured throughput, so benchmarks measure exactly those rates.

use std::{cell::Cell, rc::Rc, time::Duration};

use crate::{
    clock::ManualClock,
    device::{Accelerator, DeviceBuffer, DeviceInfo, MemoryUsage, Precision},
    error::{CheckError, Result},
};

/// Throughput the simulated device delivers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimRates {
    pub fp32_tflops: f64,
    pub fp16_tflops: f64,
    pub bandwidth_gbs: f64,
}

impl Default for SimRates {
    fn default() -> Self {
        Self {
            fp32_tflops: 29.0,
            fp16_tflops: 95.0,
            bandwidth_gbs: 850.0,
        }
    }
}

#[derive(Debug)]
pub struct SimBuffer {
    len: usize,
    precision: Precision,
    allocated: Rc<Cell<u64>>,
}

impl DeviceBuffer for SimBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn precision(&self) -> Precision {
        self.precision
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        let bytes = self.size_bytes();
        self.allocated.set(self.allocated.get().saturating_sub(bytes));
    }
}

#[derive(Debug)]
pub struct SimulatedDevice {
    info: DeviceInfo,
    clock: ManualClock,
    rates: SimRates,
    foreign_bytes: u64,
    allocated: Rc<Cell<u64>>,
    peak: Cell<u64>,
    stress_steps: Cell<u64>,
    fail_step_every: Option<u64>,
    matmuls: Cell<u64>,
    fail_matmul_every: Option<u64>,
}

impl SimulatedDevice {
    /// A healthy 24 GiB RTX 3090 with nothing else resident.
    pub fn rtx_3090(clock: ManualClock) -> Self {
        Self::new(
            DeviceInfo {
                name: "NVIDIA GeForce RTX 3090".into(),
                total_memory_bytes: 25_769_803_776,
                compute_major: 8,
                compute_minor: 6,
                driver_version: None,
            },
            clock,
        )
    }

    pub fn new(info: DeviceInfo, clock: ManualClock) -> Self {
        Self {
            info,
            clock,
            rates: SimRates::default(),
            foreign_bytes: 0,
            allocated: Rc::new(Cell::new(0)),
            peak: Cell::new(0),
            stress_steps: Cell::new(0),
            fail_step_every: None,
            matmuls: Cell::new(0),
            fail_matmul_every: None,
        }
    }

    pub fn with_rates(mut self, rates: SimRates) -> Self {
        self.rates = rates;
        self
    }

    /// Memory held by other processes, unavailable to this one.
    pub fn with_foreign_usage(mut self, bytes: u64) -> Self {
        self.foreign_bytes = bytes;
        self
    }

    /// Make every `n`th stress step fail with a runtime error.
    pub fn with_step_fault_every(mut self, n: u64) -> Self {
        self.fail_step_every = Some(n);
        self
    }

    /// Make every `n`th matmul fail with a runtime error.
    pub fn with_matmul_fault_every(mut self, n: u64) -> Self {
        self.fail_matmul_every = Some(n);
        self
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.get()
    }

    pub fn peak_allocated_bytes(&self) -> u64 {
        self.peak.get()
    }

    fn free_bytes(&self) -> u64 {
        self.info
            .total_memory_bytes
            .saturating_sub(self.foreign_bytes)
            .saturating_sub(self.allocated.get())
    }

    fn spend(&self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.clock.advance(Duration::from_secs_f64(seconds));
        }
    }

    fn transfer_seconds(&self, bytes: u64) -> f64 {
        bytes as f64 / (self.rates.bandwidth_gbs * 1e9)
    }

    fn allocate(&self, len: usize, precision: Precision) -> Result<SimBuffer> {
        let bytes = (len * precision.size_bytes()) as u64;
        if bytes > self.free_bytes() {
            return Err(CheckError::OutOfMemory {
                requested_bytes: bytes,
                detail: format!(
                    "CUDA out of memory: {:.2} GB free of {:.2} GB",
                    self.free_bytes() as f64 / 1e9,
                    self.info.total_memory_gb()
                ),
            });
        }
        let now = self.allocated.get() + bytes;
        self.allocated.set(now);
        self.peak.set(self.peak.get().max(now));
        Ok(SimBuffer {
            len,
            precision,
            allocated: Rc::clone(&self.allocated),
        })
    }
}

fn faulty(every: Option<u64>, count: u64) -> bool {
    every.is_some_and(|n| n > 0 && count % n == 0)
}

fn mismatch(what: &str) -> CheckError {
    CheckError::RuntimeInstability(format!("buffer shape mismatch in {what}"))
}

impl Accelerator for SimulatedDevice {
    type Buffer = SimBuffer;

    fn ordinal(&self) -> usize {
        0
    }

    fn info(&self) -> Result<DeviceInfo> {
        Ok(self.info.clone())
    }

    fn memory(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage {
            total_bytes: self.info.total_memory_bytes,
            free_bytes: self.free_bytes(),
            allocated_bytes: self.allocated.get(),
        })
    }

    fn runtime_versions(&self) -> Vec<(String, String)> {
        vec![("Runtime".into(), "simulated".into())]
    }

    fn alloc_random(&self, len: usize, precision: Precision, _seed: u64) -> Result<SimBuffer> {
        let buffer = self.allocate(len, precision)?;
        self.spend(self.transfer_seconds(buffer.size_bytes()));
        Ok(buffer)
    }

    fn alloc_zeros(&self, len: usize, precision: Precision) -> Result<SimBuffer> {
        self.allocate(len, precision)
    }

    fn matmul(&self, a: &SimBuffer, b: &SimBuffer, out: &mut SimBuffer, n: usize) -> Result<()> {
        let elements = n * n;
        if a.len != elements || b.len != elements || out.len != elements {
            return Err(mismatch("matmul"));
        }
        if a.precision != b.precision || a.precision != out.precision {
            return Err(mismatch("matmul precision"));
        }
        let tflops = match a.precision {
            Precision::F32 => self.rates.fp32_tflops,
            Precision::F16 => self.rates.fp16_tflops,
        };
        let count = self.matmuls.get() + 1;
        self.matmuls.set(count);
        self.spend(2.0 * (n as f64).powi(3) / (tflops * 1e12));
        if faulty(self.fail_matmul_every, count) {
            return Err(CheckError::RuntimeInstability(format!(
                "CUBLAS_STATUS_EXECUTION_FAILED in matmul {count}"
            )));
        }
        Ok(())
    }

    fn copy(&self, src: &SimBuffer, dst: &mut SimBuffer) -> Result<()> {
        if src.len != dst.len || src.precision != dst.precision {
            return Err(mismatch("copy"));
        }
        self.spend(self.transfer_seconds(src.size_bytes()));
        Ok(())
    }

    fn stress_step(&self, a: &SimBuffer, b: &SimBuffer, out: &mut SimBuffer) -> Result<()> {
        if a.len != b.len || a.len != out.len {
            return Err(mismatch("stress step"));
        }
        let step = self.stress_steps.get() + 1;
        self.stress_steps.set(step);
        self.spend(self.transfer_seconds(a.size_bytes() * 3));
        if faulty(self.fail_step_every, step) {
            return Err(CheckError::RuntimeInstability(format!(
                "illegal memory access during stress step {step}"
            )));
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn release_cached(&self) -> Result<()> {
        Ok(())
    }
}
