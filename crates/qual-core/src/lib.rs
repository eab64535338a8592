//! Threshold-graded GPU qualification checks.
//!
//! A check probes the device, drives a workload through an [`Accelerator`],
//! grades the measurements against a [`DeviceProfile`] and prints a report
//! that ends in a [`Tier`]. The tier maps onto the process exit code
//! (0 pass, 2 warning, 1 fail).
//!
//! Nothing in this crate touches real hardware. Backends implement
//! [`Accelerator`]; [`sim::SimulatedDevice`] is the in-memory one used by
//! tests and `--simulate` runs.

pub mod checks;
pub mod clock;
pub mod device;
pub mod error;
pub mod grade;
pub mod profile;
pub mod report;
pub mod signal;
pub mod sim;
pub mod utility;
pub mod workload;

pub use checks::{Check, CheckContext, run_check};
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{Accelerator, DeviceBuffer, DeviceInfo, MemoryUsage, Precision};
pub use error::{CheckError, Result};
pub use grade::{Tier, aggregate, grade};
pub use profile::DeviceProfile;
pub use report::{CheckResult, Reporter};
pub use signal::StopSignal;
pub use utility::{CannedUtility, DiagnosticUtility, NvidiaSmi};
