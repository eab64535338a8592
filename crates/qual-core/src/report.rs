//! Human-readable report output and the result every check ends with.

use std::io::Write;

use chrono::Utc;

use crate::grade::{Direction, ThresholdTable, Tier};

const WIDTH: usize = 60;

/// Final outcome of one check invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckResult {
    pub tier: Tier,
    pub exit_code: u8,
    /// Warnings and verdict lines, in the order they were printed.
    pub messages: Vec<String>,
}

impl CheckResult {
    pub fn new(tier: Tier, messages: Vec<String>) -> Self {
        Self {
            tier,
            exit_code: tier.exit_code(),
            messages,
        }
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.messages.iter().any(|message| message.contains(needle))
    }
}

/// Writes the report and remembers the lines that matter for the verdict.
///
/// Output errors are ignored: a closed stdout must not change the verdict.
pub struct Reporter<W: Write> {
    out: W,
    messages: Vec<String>,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            messages: Vec::new(),
        }
    }

    pub fn banner(&mut self, title: &str) {
        self.line("=".repeat(WIDTH));
        self.line(title);
        self.line("=".repeat(WIDTH));
    }

    /// Title banner followed by the UTC start time.
    pub fn header(&mut self, title: &str) {
        self.banner(title);
        self.line(format!("Started: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")));
    }

    pub fn rule(&mut self) {
        self.line("-".repeat(WIDTH));
    }

    pub fn blank(&mut self) {
        self.line("");
    }

    pub fn section(&mut self, title: &str) {
        self.blank();
        self.line(title);
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let _ = writeln!(self.out, "{}", text.as_ref());
    }

    /// Print a line and keep it in the result's messages.
    pub fn note(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.line(&text);
        self.messages.push(text.trim().to_string());
    }

    /// Closing verdict block: rule, headline, details, rule.
    pub fn verdict<S: AsRef<str>>(&mut self, headline: &str, details: &[S]) {
        self.blank();
        self.line("=".repeat(WIDTH));
        self.note(headline);
        for detail in details {
            self.note(detail.as_ref());
        }
        self.line("=".repeat(WIDTH));
    }

    pub fn finish(mut self, tier: Tier) -> CheckResult {
        let _ = self.out.flush();
        CheckResult::new(tier, self.messages)
    }
}

/// Per-metric verdict line, e.g. `✓ GOOD (≥25 TFLOPS)`.
pub fn tier_line(tier: Tier, table: &ThresholdTable, unit: &str) -> String {
    let cmp = match table.direction() {
        Direction::HigherIsBetter => "≥",
        Direction::LowerIsBetter => "<",
    };
    match (tier, table.bound_for(tier)) {
        (Tier::Excellent, Some(bound)) => format!("✅ EXCELLENT ({cmp}{bound} {unit})"),
        (Tier::Good, Some(bound)) => format!("✓ GOOD ({cmp}{bound} {unit})"),
        (Tier::Acceptable, Some(bound)) => format!("⚠ ACCEPTABLE ({cmp}{bound} {unit})"),
        (Tier::Fail, _) => match table.passing_bound() {
            Some(bound) if table.direction() == Direction::HigherIsBetter => {
                format!("❌ LOW (<{bound} {unit})")
            }
            Some(bound) => format!("❌ TOO HIGH (≥{bound} {unit})"),
            None => "❌ FAIL".to_string(),
        },
        (tier, None) => tier.label().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut Reporter<&mut Vec<u8>>)) -> (String, CheckResult) {
        let mut buffer = Vec::new();
        let mut reporter = Reporter::new(&mut buffer);
        f(&mut reporter);
        let result = reporter.finish(Tier::Good);
        (String::from_utf8(buffer).unwrap(), result)
    }

    #[test]
    fn verdict_block_is_framed_and_recorded() {
        let (text, result) = render(|report| {
            report.banner("SAMPLE CHECK");
            report.line("metric: 1");
            report.verdict("✅ SAMPLE CHECK: PASS", &["all good"]);
        });
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "=".repeat(60));
        assert_eq!(lines[1], "SAMPLE CHECK");
        assert!(lines.contains(&"metric: 1"));
        assert_eq!(*lines.last().unwrap(), "=".repeat(60));
        assert_eq!(result.messages, vec!["✅ SAMPLE CHECK: PASS", "all good"]);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn plain_lines_are_not_recorded() {
        let (_, result) = render(|report| {
            report.line("noise");
            report.note("   ⚠️  warning   ");
        });
        assert_eq!(result.messages, vec!["⚠️  warning"]);
        assert!(result.mentions("warning"));
    }

    #[test]
    fn tier_lines_name_the_bound() {
        let table = ThresholdTable::floors([
            (28.0, Tier::Excellent),
            (25.0, Tier::Good),
            (20.0, Tier::Acceptable),
        ]);
        assert_eq!(tier_line(Tier::Good, &table, "TFLOPS"), "✓ GOOD (≥25 TFLOPS)");
        assert_eq!(tier_line(Tier::Fail, &table, "TFLOPS"), "❌ LOW (<20 TFLOPS)");
    }
}
