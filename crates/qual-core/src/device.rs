//! Device handle abstraction and the static facts probed from it.

use serde::Serialize;
use tracing::{debug, warn};

use crate::{error::Result, utility::DiagnosticUtility};

/// Bytes per decimal gigabyte, the unit every report prints.
pub const GB: f64 = 1e9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Precision {
    F32,
    F16,
}

impl Precision {
    pub fn size_bytes(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Precision::F32 => "FP32",
            Precision::F16 => "FP16",
        }
    }
}

/// Identity and capacity of the device under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub total_memory_bytes: u64,
    pub compute_major: u32,
    pub compute_minor: u32,
    pub driver_version: Option<String>,
}

impl DeviceInfo {
    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / GB
    }

    pub fn compute_capability(&self) -> String {
        format!("{}.{}", self.compute_major, self.compute_minor)
    }
}

/// Device memory accounting at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Bytes currently held by buffers this process allocated.
    pub allocated_bytes: u64,
}

impl MemoryUsage {
    /// Memory in use by anything other than this process.
    pub fn foreign_bytes(&self) -> u64 {
        self.total_bytes
            .saturating_sub(self.free_bytes)
            .saturating_sub(self.allocated_bytes)
    }
}

/// A device-resident buffer. Dropping it releases the memory.
pub trait DeviceBuffer {
    fn len(&self) -> usize;

    fn precision(&self) -> Precision;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_bytes(&self) -> u64 {
        (self.len() * self.precision().size_bytes()) as u64
    }
}

/// Explicit handle to one accelerator. Checks receive it by reference instead
/// of reaching for a process-wide "current device".
pub trait Accelerator {
    type Buffer: DeviceBuffer;

    fn ordinal(&self) -> usize;

    fn info(&self) -> Result<DeviceInfo>;

    fn memory(&self) -> Result<MemoryUsage>;

    /// Runtime component versions worth printing (CUDA driver API, cuBLAS, ...).
    fn runtime_versions(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Allocate `len` elements filled with pseudo-random values in [-1, 1).
    fn alloc_random(&self, len: usize, precision: Precision, seed: u64) -> Result<Self::Buffer>;

    fn alloc_zeros(&self, len: usize, precision: Precision) -> Result<Self::Buffer>;

    /// `out = a · b` for row-major `n × n` matrices.
    fn matmul(
        &self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        n: usize,
    ) -> Result<()>;

    /// Device-to-device copy of `src` into `dst`.
    fn copy(&self, src: &Self::Buffer, dst: &mut Self::Buffer) -> Result<()>;

    /// `out = sqrt(|2 · (a + b)|)` elementwise, written in place into `out`.
    fn stress_step(&self, a: &Self::Buffer, b: &Self::Buffer, out: &mut Self::Buffer)
    -> Result<()>;

    /// Wait until every queued operation has finished.
    fn synchronize(&self) -> Result<()>;

    /// Return cached or pending-free memory to the driver.
    fn release_cached(&self) -> Result<()>;
}

/// Query the device's static facts, topping them up with the driver version
/// from the diagnostic utility when it is reachable.
pub fn probe<D: Accelerator>(device: &D, utility: &dyn DiagnosticUtility) -> Result<DeviceInfo> {
    let mut info = device.info()?;
    match utility.driver_version() {
        Ok(version) => info.driver_version = Some(version),
        Err(err) => {
            warn!("driver version unavailable: {err}");
            info.driver_version = None;
        }
    }
    debug!(
        name = %info.name,
        memory_bytes = info.total_memory_bytes,
        compute = %info.compute_capability(),
        "probed device {}",
        device.ordinal()
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_memory_excludes_own_allocations() {
        let usage = MemoryUsage {
            total_bytes: 24_000,
            free_bytes: 10_000,
            allocated_bytes: 4_000,
        };
        assert_eq!(usage.foreign_bytes(), 10_000);
    }

    #[test]
    fn compute_capability_formats_major_minor() {
        let info = DeviceInfo {
            name: "NVIDIA GeForce RTX 3090".into(),
            total_memory_bytes: 25_769_803_776,
            compute_major: 8,
            compute_minor: 6,
            driver_version: None,
        };
        assert_eq!(info.compute_capability(), "8.6");
        assert!((info.total_memory_gb() - 25.77).abs() < 0.01);
    }
}
