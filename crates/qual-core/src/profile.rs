//! Per-model expectations: every numeric threshold a check grades against.
//!
//! The built-in profile describes a healthy RTX 3090. A JSON file can
//! override any subset of the fields; omitted fields keep their defaults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grade::{ThresholdTable, Tier};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid profile JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid profile: {0}")]
    Invalid(String),
}

/// Floors for a higher-is-better metric.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierBounds {
    pub excellent: f64,
    pub good: f64,
    pub acceptable: f64,
}

impl TierBounds {
    pub fn table(&self) -> ThresholdTable {
        ThresholdTable::floors([
            (self.excellent, Tier::Excellent),
            (self.good, Tier::Good),
            (self.acceptable, Tier::Acceptable),
        ])
    }

    fn validate(&self, metric: &str) -> Result<(), ProfileError> {
        let ordered = self.excellent >= self.good && self.good >= self.acceptable;
        if !ordered || !(self.acceptable > 0.0) {
            return Err(ProfileError::Invalid(format!(
                "{metric} bounds must satisfy excellent >= good >= acceptable > 0"
            )));
        }
        Ok(())
    }
}

/// Ceilings for the peak temperature reached under load. The user-supplied
/// limit is the ceiling for ACCEPTABLE.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThermalBounds {
    pub excellent_below_c: u32,
    pub good_below_c: u32,
}

impl Default for ThermalBounds {
    fn default() -> Self {
        Self {
            excellent_below_c: 75,
            good_below_c: 80,
        }
    }
}

impl ThermalBounds {
    pub fn table(&self, limit_c: u32) -> ThresholdTable {
        let limit = f64::from(limit_c);
        ThresholdTable::ceilings([
            (f64::from(self.excellent_below_c).min(limit), Tier::Excellent),
            (f64::from(self.good_below_c).min(limit), Tier::Good),
            (limit, Tier::Acceptable),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Advice {
    /// Printed when benchmarks land in the acceptable band.
    pub performance_warning: String,
    /// Printed when the card runs hot but stays under the limit.
    pub thermal_warning: String,
}

impl Default for Advice {
    fn default() -> Self {
        Self {
            performance_warning: "Negotiate price down 1M VND".into(),
            thermal_warning: "Consider thermal pad replacement (-1M VND)".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceProfile {
    pub display_name: String,
    /// Substring the reported device name must contain.
    pub model_match: String,
    pub min_vram_gb: f64,
    pub min_compute_major: u32,
    pub architecture: String,
    pub idle_warm_above_c: u32,
    pub idle_hot_above_c: u32,
    pub fp32_tflops: TierBounds,
    pub fp16_tflops: TierBounds,
    pub bandwidth_gbs: TierBounds,
    pub thermal: ThermalBounds,
    pub advice: Advice,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::rtx_3090()
    }
}

impl DeviceProfile {
    pub fn rtx_3090() -> Self {
        Self {
            display_name: "RTX 3090".into(),
            model_match: "3090".into(),
            min_vram_gb: 23.5,
            min_compute_major: 8,
            architecture: "Ampere architecture (GA102)".into(),
            idle_warm_above_c: 45,
            idle_hot_above_c: 50,
            fp32_tflops: TierBounds {
                excellent: 28.0,
                good: 25.0,
                acceptable: 20.0,
            },
            fp16_tflops: TierBounds {
                excellent: 90.0,
                good: 75.0,
                acceptable: 60.0,
            },
            bandwidth_gbs: TierBounds {
                excellent: 800.0,
                good: 600.0,
                acceptable: 400.0,
            },
            thermal: ThermalBounds::default(),
            advice: Advice::default(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProfileError> {
        let profile: Self = serde_json::from_str(raw)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        self.fp32_tflops.validate("fp32_tflops")?;
        self.fp16_tflops.validate("fp16_tflops")?;
        self.bandwidth_gbs.validate("bandwidth_gbs")?;
        if self.thermal.excellent_below_c > self.thermal.good_below_c {
            return Err(ProfileError::Invalid(
                "thermal.excellent_below_c must not exceed thermal.good_below_c".into(),
            ));
        }
        if self.idle_warm_above_c > self.idle_hot_above_c {
            return Err(ProfileError::Invalid(
                "idle_warm_above_c must not exceed idle_hot_above_c".into(),
            ));
        }
        if !(self.min_vram_gb >= 0.0) {
            return Err(ProfileError::Invalid("min_vram_gb must be non-negative".into()));
        }
        Ok(())
    }
}
