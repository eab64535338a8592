use thiserror::Error;

/// Failure modes a check can run into. Every variant is matched once, at the
/// reporting boundary in [`crate::checks::run_check`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckError {
    /// No compatible accelerator could be opened.
    #[error("no compatible GPU available: {0}")]
    DeviceUnavailable(String),
    /// An allocation asked for more device memory than was free.
    #[error("out of memory while allocating {requested_bytes} bytes: {detail}")]
    OutOfMemory { requested_bytes: u64, detail: String },
    /// The vendor diagnostic utility is missing, failed or printed garbage.
    #[error("diagnostic utility unavailable: {0}")]
    UtilityUnavailable(String),
    /// A device operation failed for a reason other than memory exhaustion.
    #[error("device runtime error: {0}")]
    RuntimeInstability(String),
    /// The user asked to stop before the workload finished.
    #[error("interrupted by user after {iterations} iterations")]
    UserInterrupted { iterations: u64 },
}

impl CheckError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, CheckError::OutOfMemory { .. })
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;
