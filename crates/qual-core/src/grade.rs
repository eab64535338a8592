//! Threshold tables and the tiered verdicts they produce.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Graded outcome of a metric or a whole check. Ordered worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fail,
    Acceptable,
    Good,
    Excellent,
}

impl Tier {
    /// Process exit code consumed by the purchase-decision scripts.
    pub fn exit_code(self) -> u8 {
        match self {
            Tier::Excellent | Tier::Good => 0,
            Tier::Acceptable => 2,
            Tier::Fail => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Excellent => "EXCELLENT",
            Tier::Good => "GOOD",
            Tier::Acceptable => "ACCEPTABLE",
            Tier::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bounds are inclusive floors: `value >= bound`.
    HigherIsBetter,
    /// Bounds are exclusive ceilings: `value < bound`.
    LowerIsBetter,
}

/// Ordered `(bound, tier)` pairs, stored best tier first.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdTable {
    direction: Direction,
    bounds: Vec<(f64, Tier)>,
}

impl ThresholdTable {
    /// Table for throughput-like metrics. Entries may be given in any order.
    pub fn floors(bounds: impl IntoIterator<Item = (f64, Tier)>) -> Self {
        let mut bounds: Vec<_> = bounds
            .into_iter()
            .filter(|(_, tier)| *tier != Tier::Fail)
            .collect();
        bounds.sort_by(|a, b| b.0.total_cmp(&a.0));
        Self {
            direction: Direction::HigherIsBetter,
            bounds,
        }
    }

    /// Table for temperature-like metrics. Entries may be given in any order.
    pub fn ceilings(bounds: impl IntoIterator<Item = (f64, Tier)>) -> Self {
        let mut bounds: Vec<_> = bounds
            .into_iter()
            .filter(|(_, tier)| *tier != Tier::Fail)
            .collect();
        bounds.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            direction: Direction::LowerIsBetter,
            bounds,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The bound a value has to meet to reach `tier`, if the table has one.
    pub fn bound_for(&self, tier: Tier) -> Option<f64> {
        self.bounds
            .iter()
            .find(|(_, candidate)| *candidate == tier)
            .map(|(bound, _)| *bound)
    }

    /// The lowest bound that still avoids FAIL.
    pub fn passing_bound(&self) -> Option<f64> {
        self.bounds.last().map(|(bound, _)| *bound)
    }

    /// First tier whose bound the value meets; FAIL when none does (NaN included).
    pub fn grade(&self, value: f64) -> Tier {
        self.bounds
            .iter()
            .find(|(bound, _)| match self.direction {
                Direction::HigherIsBetter => value >= *bound,
                Direction::LowerIsBetter => value < *bound,
            })
            .map(|(_, tier)| *tier)
            .unwrap_or(Tier::Fail)
    }
}

pub fn grade(metric: &str, value: f64, table: &ThresholdTable) -> Tier {
    let tier = table.grade(value);
    debug!(metric, value, %tier, "graded");
    tier
}

/// One metric's observation and verdict, kept for summaries and failure lists.
#[derive(Clone, Debug, PartialEq)]
pub struct GradedMetric {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub tier: Tier,
    /// Bound the metric had to meet to avoid FAIL.
    pub required: Option<f64>,
}

impl GradedMetric {
    pub fn new(metric: &str, value: f64, unit: &str, table: &ThresholdTable) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
            tier: grade(metric, value, table),
            required: table.passing_bound(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    pub tier: Tier,
    /// Metrics that fell below their acceptable bound, in input order.
    pub failures: Vec<GradedMetric>,
}

/// Combine per-metric verdicts: the check is only as good as its worst metric.
/// An empty set verifies nothing and therefore fails.
pub fn aggregate(metrics: &[GradedMetric]) -> Aggregate {
    let tier = metrics
        .iter()
        .map(|metric| metric.tier)
        .min()
        .unwrap_or(Tier::Fail);
    let failures = metrics
        .iter()
        .filter(|metric| metric.tier == Tier::Fail)
        .cloned()
        .collect();
    Aggregate { tier, failures }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bandwidth() -> ThresholdTable {
        ThresholdTable::floors([
            (400.0, Tier::Acceptable),
            (800.0, Tier::Excellent),
            (600.0, Tier::Good),
        ])
    }

    #[test]
    fn floors_are_inclusive() {
        let table = bandwidth();
        assert_eq!(table.grade(600.0), Tier::Good);
        assert_eq!(table.grade(599.99), Tier::Acceptable);
        assert_eq!(table.grade(800.0), Tier::Excellent);
        assert_eq!(table.grade(400.0), Tier::Acceptable);
        assert_eq!(table.grade(399.9), Tier::Fail);
    }

    #[test]
    fn ceilings_are_exclusive() {
        let table = ThresholdTable::ceilings([
            (75.0, Tier::Excellent),
            (80.0, Tier::Good),
            (85.0, Tier::Acceptable),
        ]);
        assert_eq!(table.grade(74.0), Tier::Excellent);
        assert_eq!(table.grade(75.0), Tier::Good);
        assert_eq!(table.grade(84.0), Tier::Acceptable);
        assert_eq!(table.grade(85.0), Tier::Fail);
    }

    #[test]
    fn nan_grades_as_fail() {
        assert_eq!(bandwidth().grade(f64::NAN), Tier::Fail);
    }

    #[test]
    fn bound_lookup() {
        let table = bandwidth();
        assert_eq!(table.bound_for(Tier::Good), Some(600.0));
        assert_eq!(table.bound_for(Tier::Fail), None);
        assert_eq!(table.passing_bound(), Some(400.0));
    }

    #[test]
    fn exit_codes_follow_the_tristate_convention() {
        assert_eq!(Tier::Excellent.exit_code(), 0);
        assert_eq!(Tier::Good.exit_code(), 0);
        assert_eq!(Tier::Acceptable.exit_code(), 2);
        assert_eq!(Tier::Fail.exit_code(), 1);
    }

    #[test]
    fn aggregate_takes_the_worst_tier_and_lists_failures() {
        let table = bandwidth();
        let metrics = vec![
            GradedMetric::new("A", 900.0, "GB/s", &table),
            GradedMetric::new("B", 100.0, "GB/s", &table),
            GradedMetric::new("C", 450.0, "GB/s", &table),
        ];
        let result = aggregate(&metrics);
        assert_eq!(result.tier, Tier::Fail);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].metric, "B");
        assert_eq!(result.failures[0].required, Some(400.0));
    }

    #[test]
    fn empty_aggregate_fails() {
        assert_eq!(aggregate(&[]).tier, Tier::Fail);
    }
}
