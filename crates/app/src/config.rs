use std::{fs, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use qual_core::{
    DeviceProfile,
    checks::{ThermalConfig, VramConfig, VramSize},
};

use crate::cli::{Cli, Command};

/// Which checks to run, with their validated settings.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Info,
    Performance,
    Vram(VramConfig),
    Thermal(ThermalConfig),
    All {
        vram: VramConfig,
        thermal: ThermalConfig,
    },
}

impl Selection {
    /// Stress runs are the only ones worth interrupting with Ctrl+C.
    pub fn is_interruptible(&self) -> bool {
        !matches!(self, Selection::Info | Selection::Performance)
    }
}

#[derive(Clone, Debug)]
pub struct QualifyConfig {
    pub device: usize,
    pub profile: DeviceProfile,
    pub simulate: bool,
    pub verbose: bool,
    pub selection: Selection,
}

fn minutes(value: u64, flag: &str) -> Result<Duration> {
    if value < 1 {
        bail!("{flag} must be at least 1 minute");
    }
    let secs = value
        .checked_mul(60)
        .ok_or_else(|| anyhow!("{flag} is too large"))?;
    Ok(Duration::from_secs(secs))
}

fn vram_config(duration: u64, size: &str) -> Result<VramConfig> {
    Ok(VramConfig {
        duration: minutes(duration, "--duration")?,
        size: size.parse::<VramSize>().map_err(|err| anyhow!(err))?,
    })
}

fn thermal_config(duration: u64, limit: u32) -> Result<ThermalConfig> {
    if limit == 0 {
        bail!("--limit must be a positive temperature");
    }
    Ok(ThermalConfig {
        duration: minutes(duration, "--duration")?,
        limit_c: limit,
        ..ThermalConfig::default()
    })
}

impl TryFrom<Cli> for QualifyConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let selection = match cli.command {
            Command::Info => Selection::Info,
            Command::Perf => Selection::Performance,
            Command::Vram { duration, size } => Selection::Vram(vram_config(duration, &size)?),
            Command::Thermal { duration, limit } => {
                Selection::Thermal(thermal_config(duration, limit)?)
            }
            Command::All {
                vram_duration,
                size,
                thermal_duration,
                limit,
            } => Selection::All {
                vram: vram_config(vram_duration, &size)?,
                thermal: thermal_config(thermal_duration, limit)?,
            },
        };

        let profile = match &cli.global.profile {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read profile {}", path.display()))?;
                DeviceProfile::from_json_str(&raw)
                    .with_context(|| format!("invalid profile {}", path.display()))?
            }
            None => DeviceProfile::rtx_3090(),
        };

        Ok(Self {
            device: cli.global.device,
            profile,
            simulate: cli.global.simulate,
            verbose: cli.global.verbose,
            selection,
        })
    }
}
