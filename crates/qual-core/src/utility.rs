//! Best-effort access to the vendor diagnostic utility.
//!
//! Everything behind [`DiagnosticUtility`] may fail; callers omit the field
//! and carry on rather than failing the check.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    path::PathBuf,
    process::Command,
};

use tracing::debug;

use crate::error::{CheckError, Result};

/// Negotiated PCIe link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcieLink {
    pub generation: u32,
    pub width: u32,
}

impl PcieLink {
    pub fn is_full_width(&self) -> bool {
        self.width >= 16
    }
}

impl fmt::Display for PcieLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gen {} x{}", self.generation, self.width)
    }
}

pub trait DiagnosticUtility {
    /// Current GPU core temperature in °C.
    fn temperature(&self) -> Result<u32>;

    fn driver_version(&self) -> Result<String>;

    fn pcie_link(&self) -> Result<PcieLink>;
}

/// Shells out to `nvidia-smi` with fixed query sets.
#[derive(Clone, Debug)]
pub struct NvidiaSmi {
    binary: PathBuf,
    ordinal: usize,
}

impl NvidiaSmi {
    pub fn new(ordinal: usize) -> Self {
        Self {
            binary: PathBuf::from("nvidia-smi"),
            ordinal,
        }
    }

    /// Use a specific executable instead of resolving `nvidia-smi` on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn query(&self, fields: &str) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-i")
            .arg(self.ordinal.to_string())
            .arg(format!("--query-gpu={fields}"))
            .arg("--format=csv,noheader")
            .output()
            .map_err(|err| {
                CheckError::UtilityUnavailable(format!(
                    "failed to run {}: {err}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CheckError::UtilityUnavailable(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = first_line(&stdout)?;
        debug!(fields, line, "nvidia-smi query");
        Ok(line.to_string())
    }
}

impl DiagnosticUtility for NvidiaSmi {
    fn temperature(&self) -> Result<u32> {
        parse_temperature(&self.query("temperature.gpu")?)
    }

    fn driver_version(&self) -> Result<String> {
        let version = self.query("driver_version")?;
        if is_not_available(&version) {
            return Err(CheckError::UtilityUnavailable(
                "driver version not reported".into(),
            ));
        }
        Ok(version)
    }

    fn pcie_link(&self) -> Result<PcieLink> {
        parse_pcie_link(&self.query("pcie.link.gen.current,pcie.link.width.current")?)
    }
}

fn first_line(stdout: &str) -> Result<&str> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| CheckError::UtilityUnavailable("empty output".into()))
}

fn is_not_available(field: &str) -> bool {
    field.is_empty() || field.eq_ignore_ascii_case("[N/A]") || field.starts_with("[Not")
}

/// Parse a `temperature.gpu` value such as `41`.
pub fn parse_temperature(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    raw.parse::<u32>()
        .map_err(|_| CheckError::UtilityUnavailable(format!("malformed temperature {raw:?}")))
}

/// Parse a `pcie.link.gen.current,pcie.link.width.current` row such as `4, 16`.
pub fn parse_pcie_link(raw: &str) -> Result<PcieLink> {
    let malformed = || CheckError::UtilityUnavailable(format!("malformed PCIe link {raw:?}"));
    let mut fields = raw.split(',').map(str::trim);
    let generation = fields
        .next()
        .and_then(|field| field.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let width = fields
        .next()
        .and_then(|field| field.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }
    Ok(PcieLink { generation, width })
}

/// Fixed answers for tests and simulated runs.
///
/// Temperatures are handed out in order; once the queue runs dry the last
/// reading repeats.
#[derive(Debug, Default)]
pub struct CannedUtility {
    temperatures: RefCell<VecDeque<u32>>,
    last_temperature: Cell<Option<u32>>,
    temperature_reads: Cell<usize>,
    driver_version: Option<String>,
    pcie_link: Option<PcieLink>,
}

impl CannedUtility {
    /// A utility that fails every query, as if `nvidia-smi` were missing.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Typical healthy RTX 3090 readings.
    pub fn healthy() -> Self {
        Self::unavailable()
            .with_driver_version("550.54.14")
            .with_pcie_link(PcieLink {
                generation: 4,
                width: 16,
            })
            .with_temperatures([38, 55, 63, 68, 71, 72, 72])
    }

    pub fn with_driver_version(mut self, version: impl Into<String>) -> Self {
        self.driver_version = Some(version.into());
        self
    }

    pub fn with_pcie_link(mut self, link: PcieLink) -> Self {
        self.pcie_link = Some(link);
        self
    }

    pub fn with_temperatures(self, readings: impl IntoIterator<Item = u32>) -> Self {
        self.temperatures.replace(readings.into_iter().collect());
        self.last_temperature.set(None);
        self
    }

    pub fn temperature_reads(&self) -> usize {
        self.temperature_reads.get()
    }
}

impl DiagnosticUtility for CannedUtility {
    fn temperature(&self) -> Result<u32> {
        let next = self.temperatures.borrow_mut().pop_front();
        let reading = next
            .or(self.last_temperature.get())
            .ok_or_else(|| CheckError::UtilityUnavailable("no temperature configured".into()))?;
        self.last_temperature.set(Some(reading));
        self.temperature_reads.set(self.temperature_reads.get() + 1);
        Ok(reading)
    }

    fn driver_version(&self) -> Result<String> {
        self.driver_version
            .clone()
            .ok_or_else(|| CheckError::UtilityUnavailable("no driver version configured".into()))
    }

    fn pcie_link(&self) -> Result<PcieLink> {
        self.pcie_link
            .ok_or_else(|| CheckError::UtilityUnavailable("no PCIe link configured".into()))
    }
}
