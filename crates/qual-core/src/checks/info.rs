use std::io::Write;

use tracing::warn;

use crate::{
    checks::{Check, CheckContext},
    device::{Accelerator, GB, probe},
    error::Result,
    grade::{GradedMetric, ThresholdTable, Tier},
    report::Reporter,
};

/// Identity and static-health check: model, capacity, architecture, idle
/// temperature, software versions and PCIe link.
#[derive(Clone, Copy, Debug, Default)]
pub struct InfoCheck;

impl Check for InfoCheck {
    fn title(&self) -> &'static str {
        "GPU INFORMATION CHECK"
    }

    fn allocates(&self) -> bool {
        false
    }

    fn execute<D: Accelerator, W: Write>(
        &self,
        ctx: &CheckContext<'_, D>,
        report: &mut Reporter<W>,
    ) -> Result<Tier> {
        let profile = ctx.profile;
        let info = probe(ctx.device, ctx.utility)?;

        report.section("📊 GPU Details:");
        report.line(format!("   Name: {}", info.name));
        if info.name.contains(&profile.model_match) {
            report.line("   ✓ Correct model detected");
        } else {
            report.note(format!(
                "   ⚠️  WARNING: Expected {}, got {}",
                profile.display_name, info.name
            ));
        }

        report.section("💾 VRAM:");
        let vram_gb = info.total_memory_gb();
        report.line(format!("   Total: {vram_gb:.2} GB"));
        let memory = ctx.device.memory()?;
        report.line(format!("   Free:  {:.2} GB", memory.free_bytes as f64 / GB));
        let capacity_table = ThresholdTable::floors([(profile.min_vram_gb, Tier::Good)]);
        let capacity = GradedMetric::new("VRAM", vram_gb, "GB", &capacity_table);
        if capacity.tier == Tier::Fail {
            report.note(format!(
                "   ❌ VRAM too low! Expected {} GB, got {vram_gb:.2} GB",
                profile.min_vram_gb
            ));
        } else {
            report.line("   ✓ VRAM capacity correct");
        }

        report.section("⚙️  Compute Capability:");
        report.line(format!("   Version: {}", info.compute_capability()));
        if info.compute_major < profile.min_compute_major {
            report.note("   ⚠️  Old architecture detected");
        } else {
            report.line(format!("   ✓ {}", profile.architecture));
        }

        match ctx.utility.temperature() {
            Ok(temp) => {
                report.section("🌡️  Temperature (Idle):");
                report.line(format!("   Current: {temp}°C"));
                if temp > profile.idle_hot_above_c {
                    report.note(format!(
                        "   ⚠️  High idle temperature! Should be 30-{}°C",
                        profile.idle_warm_above_c
                    ));
                    report.note("   → Possible cooling issue or recent use");
                } else if temp > profile.idle_warm_above_c {
                    report.note("   ⚠️  Slightly warm at idle");
                } else {
                    report.line("   ✓ Normal idle temperature");
                }
            }
            Err(err) => {
                warn!("idle temperature unavailable: {err}");
                report.blank();
                report.note("⚠️  Could not read temperature");
            }
        }

        report.section("🔧 Software:");
        for (component, version) in ctx.device.runtime_versions() {
            report.line(format!("   {component}: {version}"));
        }
        match &info.driver_version {
            Some(driver) => report.line(format!("   Driver: {driver}")),
            None => report.line("   Driver: Unknown"),
        }

        match ctx.utility.pcie_link() {
            Ok(link) => {
                report.section("🔌 PCIe Link:");
                report.line(format!("   {link}"));
                if link.is_full_width() {
                    report.line("   ✓ PCIe x16 (full bandwidth)");
                } else {
                    report.note("   ⚠️  Not running at x16 (may impact performance)");
                }
            }
            Err(err) => {
                warn!("PCIe link state unavailable: {err}");
                report.blank();
                report.note("⚠️  Could not read PCIe info");
            }
        }

        let title = self.title();
        if capacity.tier == Tier::Fail {
            report.verdict(&format!("❌ {title}: FAIL"), &[format!(
                "❌ VRAM: {vram_gb:.2} GB (expected >= {})",
                profile.min_vram_gb
            )]);
        } else {
            report.verdict(&format!("✅ {title}: PASS"), &[] as &[&str]);
        }
        Ok(capacity.tier)
    }
}
