//! CUDA implementation of [`Accelerator`].
//!
//! Elementwise kernels are compiled at runtime with NVRTC, matrix products go
//! through cuBLAS. Every buffer is a `CudaSlice` owned by a [`CudaBuffer`], so
//! device memory is released when the buffer is dropped.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use cudarc::{
    cublas::{CudaBlas, Gemm, GemmConfig, result::CublasError, sys::cublasOperation_t},
    driver::{
        CudaContext, CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig,
        PushKernelArg, result, sys,
    },
    nvrtc::compile_ptx,
};
use half::f16;
use qual_core::{
    Accelerator, CheckError, DeviceBuffer, DeviceInfo, MemoryUsage, Precision, Result,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info};

const KERNELS: &str = r#"
    extern "C" __global__ void fill_uniform(float* out, size_t len, unsigned long long seed) {
        size_t idx = blockIdx.x * blockDim.x + threadIdx.x;
        if (idx < len) {
            unsigned long long z = seed + (idx + 1) * 0x9E3779B97F4A7C15ull;
            z = (z ^ (z >> 30)) * 0xBF58476D1CE4E5B9ull;
            z = (z ^ (z >> 27)) * 0x94D049BB133111EBull;
            z = z ^ (z >> 31);
            out[idx] = (float)(z >> 40) / 8388608.0f - 1.0f;
        }
    }

    extern "C" __global__ void stress_step(const float* a, const float* b, float* out, size_t len) {
        size_t idx = blockIdx.x * blockDim.x + threadIdx.x;
        if (idx < len) {
            out[idx] = sqrtf(fabsf((a[idx] + b[idx]) * 2.0f));
        }
    }
"#;

fn driver_error(err: DriverError) -> CheckError {
    if err.0 == sys::cudaError_enum::CUDA_ERROR_OUT_OF_MEMORY {
        CheckError::OutOfMemory {
            requested_bytes: 0,
            detail: err.to_string(),
        }
    } else {
        CheckError::RuntimeInstability(err.to_string())
    }
}

fn alloc_error(err: DriverError, bytes: u64) -> CheckError {
    match driver_error(err) {
        CheckError::OutOfMemory { detail, .. } => CheckError::OutOfMemory {
            requested_bytes: bytes,
            detail,
        },
        other => other,
    }
}

fn blas_error(err: CublasError) -> CheckError {
    CheckError::RuntimeInstability(format!("cuBLAS: {err}"))
}

enum Storage {
    F32(CudaSlice<f32>),
    F16(CudaSlice<f16>),
}

/// Device allocation tagged with its precision. Dropping it frees the memory
/// and updates the owning accelerator's accounting.
pub struct CudaBuffer {
    storage: Storage,
    len: usize,
    allocated: Arc<AtomicU64>,
}

impl DeviceBuffer for CudaBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn precision(&self) -> Precision {
        match self.storage {
            Storage::F32(_) => Precision::F32,
            Storage::F16(_) => Precision::F16,
        }
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.size_bytes(), Ordering::Relaxed);
    }
}

/// One CUDA device with its stream, compiled kernels and cuBLAS handle.
pub struct CudaAccelerator {
    ordinal: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    blas: CudaBlas,
    fill_fn: CudaFunction,
    stress_fn: CudaFunction,
    allocated: Arc<AtomicU64>,
}

impl CudaAccelerator {
    /// Open device `ordinal`. A missing driver or device surfaces as
    /// [`CheckError::DeviceUnavailable`].
    pub fn open(ordinal: usize) -> Result<Self> {
        let context = panic::catch_unwind(AssertUnwindSafe(|| CudaContext::new(ordinal)))
            .map_err(|_| {
                CheckError::DeviceUnavailable("CUDA driver library could not be loaded".into())
            })?
            .map_err(|err| CheckError::DeviceUnavailable(format!("device {ordinal}: {err}")))?;

        let ptx = compile_ptx(KERNELS)
            .map_err(|err| CheckError::RuntimeInstability(format!("NVRTC: {err}")))?;
        let module = context.load_module(ptx).map_err(driver_error)?;
        let fill_fn = module.load_function("fill_uniform").map_err(driver_error)?;
        let stress_fn = module.load_function("stress_step").map_err(driver_error)?;
        let stream = context.default_stream();
        let blas = CudaBlas::new(stream.clone()).map_err(blas_error)?;
        info!(ordinal, "CUDA device opened");

        Ok(Self {
            ordinal,
            context,
            stream,
            blas,
            fill_fn,
            stress_fn,
            allocated: Arc::new(AtomicU64::new(0)),
        })
    }

    fn attribute(&self, attribute: sys::CUdevice_attribute) -> Result<u32> {
        let value = self.context.attribute(attribute).map_err(driver_error)?;
        Ok(u32::try_from(value).unwrap_or_default())
    }

    fn wrap(&self, storage: Storage, len: usize) -> CudaBuffer {
        let buffer = CudaBuffer {
            storage,
            len,
            allocated: Arc::clone(&self.allocated),
        };
        self.allocated.fetch_add(buffer.size_bytes(), Ordering::Relaxed);
        buffer
    }

    fn zeros(&self, len: usize, precision: Precision) -> Result<Storage> {
        let bytes = (len * precision.size_bytes()) as u64;
        let storage = match precision {
            Precision::F32 => Storage::F32(
                self.stream
                    .alloc_zeros::<f32>(len)
                    .map_err(|err| alloc_error(err, bytes))?,
            ),
            Precision::F16 => Storage::F16(
                self.stream
                    .alloc_zeros::<f16>(len)
                    .map_err(|err| alloc_error(err, bytes))?,
            ),
        };
        Ok(storage)
    }

    fn gemm<T>(
        &self,
        a: &CudaSlice<T>,
        b: &CudaSlice<T>,
        out: &mut CudaSlice<T>,
        n: usize,
        one: T,
        zero: T,
    ) -> Result<()>
    where
        CudaBlas: Gemm<T>,
    {
        let n = i32::try_from(n)
            .map_err(|_| CheckError::RuntimeInstability(format!("matrix size {n} too large")))?;
        // Row-major A·B is column-major Bᵀ·Aᵀ, so the operands swap.
        let cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_N,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: n,
            n,
            k: n,
            alpha: one,
            lda: n,
            ldb: n,
            beta: zero,
            ldc: n,
        };
        unsafe { self.blas.gemm(cfg, b, a, out) }.map_err(blas_error)
    }
}

fn mismatch(what: &str) -> CheckError {
    CheckError::RuntimeInstability(format!("buffer shape mismatch in {what}"))
}

impl Accelerator for CudaAccelerator {
    type Buffer = CudaBuffer;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn info(&self) -> Result<DeviceInfo> {
        let name = self.context.name().map_err(driver_error)?;
        let memory = self.memory()?;
        Ok(DeviceInfo {
            name,
            total_memory_bytes: memory.total_bytes,
            compute_major: self.attribute(
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
            )?,
            compute_minor: self.attribute(
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
            )?,
            driver_version: None,
        })
    }

    fn memory(&self) -> Result<MemoryUsage> {
        self.context.bind_to_thread().map_err(driver_error)?;
        let (free, total) = result::mem_get_info().map_err(driver_error)?;
        Ok(MemoryUsage {
            total_bytes: total as u64,
            free_bytes: free as u64,
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
        })
    }

    fn runtime_versions(&self) -> Vec<(String, String)> {
        let mut version = 0;
        let mut versions = Vec::new();
        if unsafe { sys::cuDriverGetVersion(&mut version) }.result().is_ok() {
            versions.push((
                "CUDA (driver API)".to_string(),
                format!("{}.{}", version / 1000, (version % 1000) / 10),
            ));
        }
        versions
    }

    fn alloc_random(&self, len: usize, precision: Precision, seed: u64) -> Result<CudaBuffer> {
        let storage = match precision {
            Precision::F32 => {
                let mut slice = match self.zeros(len, precision)? {
                    Storage::F32(slice) => slice,
                    Storage::F16(_) => return Err(mismatch("random fill")),
                };
                let launch = LaunchConfig::for_num_elems(
                    u32::try_from(len).map_err(|_| mismatch("random fill length"))?,
                );
                unsafe {
                    self.stream
                        .launch_builder(&self.fill_fn)
                        .arg(&mut slice)
                        .arg(&len)
                        .arg(&seed)
                        .launch(launch)
                }
                .map_err(driver_error)?;
                Storage::F32(slice)
            }
            Precision::F16 => {
                let mut rng = StdRng::seed_from_u64(seed);
                let host: Vec<f16> = (0..len)
                    .map(|_| f16::from_f32(rng.gen_range(-1.0f32..1.0)))
                    .collect();
                let bytes = (len * precision.size_bytes()) as u64;
                Storage::F16(
                    self.stream
                        .memcpy_stod(&host)
                        .map_err(|err| alloc_error(err, bytes))?,
                )
            }
        };
        debug!(len, precision = precision.label(), "random buffer ready");
        Ok(self.wrap(storage, len))
    }

    fn alloc_zeros(&self, len: usize, precision: Precision) -> Result<CudaBuffer> {
        let storage = self.zeros(len, precision)?;
        Ok(self.wrap(storage, len))
    }

    fn matmul(&self, a: &CudaBuffer, b: &CudaBuffer, out: &mut CudaBuffer, n: usize) -> Result<()> {
        let elements = n * n;
        if a.len != elements || b.len != elements || out.len != elements {
            return Err(mismatch("matmul"));
        }
        match (&a.storage, &b.storage, &mut out.storage) {
            (Storage::F32(a), Storage::F32(b), Storage::F32(out)) => {
                self.gemm(a, b, out, n, 1.0f32, 0.0f32)
            }
            (Storage::F16(a), Storage::F16(b), Storage::F16(out)) => {
                self.gemm(a, b, out, n, f16::ONE, f16::ZERO)
            }
            _ => Err(mismatch("matmul precision")),
        }
    }

    fn copy(&self, src: &CudaBuffer, dst: &mut CudaBuffer) -> Result<()> {
        if src.len != dst.len {
            return Err(mismatch("copy"));
        }
        match (&src.storage, &mut dst.storage) {
            (Storage::F32(src), Storage::F32(dst)) => {
                self.stream.memcpy_dtod(src, dst).map_err(driver_error)
            }
            (Storage::F16(src), Storage::F16(dst)) => {
                self.stream.memcpy_dtod(src, dst).map_err(driver_error)
            }
            _ => Err(mismatch("copy precision")),
        }
    }

    fn stress_step(&self, a: &CudaBuffer, b: &CudaBuffer, out: &mut CudaBuffer) -> Result<()> {
        let len = out.len;
        if a.len != len || b.len != len {
            return Err(mismatch("stress step"));
        }
        let (Storage::F32(a), Storage::F32(b), Storage::F32(out)) =
            (&a.storage, &b.storage, &mut out.storage)
        else {
            return Err(mismatch("stress step precision"));
        };
        let launch = LaunchConfig::for_num_elems(
            u32::try_from(len).map_err(|_| mismatch("stress step length"))?,
        );
        unsafe {
            self.stream
                .launch_builder(&self.stress_fn)
                .arg(a)
                .arg(b)
                .arg(out)
                .arg(&len)
                .launch(launch)
        }
        .map_err(driver_error)?;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().map_err(driver_error)
    }

    fn release_cached(&self) -> Result<()> {
        self.context.synchronize().map_err(driver_error)
    }
}
