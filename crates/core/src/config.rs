//! Run configuration: which passes to run, over which segments, and the
//! tunables the heuristics use.
//!
//! Loaded from YAML or JSON (chosen by file extension); every field has a
//! default so a partial file is fine.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Exit/exception routine name fragments that make a trailing call expected.
pub const DEFAULT_EXIT_NAME_FRAGMENTS: [&str; 6] =
    ["exception", "handler", "exitprocess", "fatalappexit", "_abort", "_exit"];

const PASS_STRAY_DATA: u8 = 1 << 0;
const PASS_ALIGNMENT: u8 = 1 << 1;
const PASS_MISSING_CODE: u8 = 1 << 2;
const PASS_FUNCTION_GAPS: u8 = 1 << 3;

/// The four passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    StrayData,
    Alignment,
    MissingCode,
    FunctionGaps,
}

impl Pass {
    pub const ALL: [Pass; 4] =
        [Pass::StrayData, Pass::Alignment, Pass::MissingCode, Pass::FunctionGaps];

    pub fn title(self) -> &'static str {
        match self {
            Pass::StrayData => "Fixing bad code bytes",
            Pass::Alignment => "Missing align blocks",
            Pass::MissingCode => "Missing code",
            Pass::FunctionGaps => "Missing functions",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Pass::StrayData => PASS_STRAY_DATA,
            Pass::Alignment => PASS_ALIGNMENT,
            Pass::MissingCode => PASS_MISSING_CODE,
            Pass::FunctionGaps => PASS_FUNCTION_GAPS,
        }
    }
}

/// Which passes are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassSelection {
    pub stray_data: bool,
    pub alignment: bool,
    pub missing_code: bool,
    pub function_gaps: bool,
}

impl Default for PassSelection {
    fn default() -> Self {
        Self { stray_data: true, alignment: true, missing_code: true, function_gaps: true }
    }
}

impl PassSelection {
    pub fn none() -> Self {
        Self { stray_data: false, alignment: false, missing_code: false, function_gaps: false }
    }

    /// Build from a 4-bit mask (bit 0 = stray data ... bit 3 = function gaps).
    pub fn from_bits(bits: u8) -> Self {
        Self {
            stray_data: bits & PASS_STRAY_DATA != 0,
            alignment: bits & PASS_ALIGNMENT != 0,
            missing_code: bits & PASS_MISSING_CODE != 0,
            function_gaps: bits & PASS_FUNCTION_GAPS != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        Pass::ALL.iter().filter(|p| self.is_enabled(**p)).fold(0, |acc, p| acc | p.bit())
    }

    pub fn is_enabled(&self, pass: Pass) -> bool {
        match pass {
            Pass::StrayData => self.stray_data,
            Pass::Alignment => self.alignment,
            Pass::MissingCode => self.missing_code,
            Pass::FunctionGaps => self.function_gaps,
        }
    }

    pub fn set(&mut self, pass: Pass, enabled: bool) {
        match pass {
            Pass::StrayData => self.stray_data = enabled,
            Pass::Alignment => self.alignment = enabled,
            Pass::MissingCode => self.missing_code = enabled,
            Pass::FunctionGaps => self.function_gaps = enabled,
        }
    }

    pub fn any(&self) -> bool {
        self.bits() != 0
    }

    /// First enabled pass strictly after `after` (or the first overall).
    pub fn next_after(&self, after: Option<Pass>) -> Option<Pass> {
        let skip = after.map_or(0, |p| p as usize + 1);
        Pass::ALL.into_iter().skip(skip).find(|p| self.is_enabled(*p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub passes: PassSelection,
    /// Segment names to process, in order. Empty means the first code segment.
    pub regions: Vec<String>,
    pub stray_data_sweeps: u32,
    /// Stop stray-data sweeps early after one that changed nothing.
    pub stop_sweeps_at_fixpoint: bool,
    /// Boundary a padding run must end on.
    pub alignment: u64,
    /// Runs this short need cross-reference evidence to count as padding.
    pub short_run_max: u64,
    pub exit_name_fragments: Vec<String>,
    /// Scan steps between cancellation checks.
    pub poll_interval: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            passes: PassSelection::default(),
            regions: Vec::new(),
            stray_data_sweeps: 8,
            stop_sweeps_at_fixpoint: false,
            alignment: 16,
            short_run_max: 2,
            exit_name_fragments: DEFAULT_EXIT_NAME_FRAGMENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_interval: 256,
        }
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(anyhow!("alignment must be a power of two (got {})", self.alignment));
        }
        if self.stray_data_sweeps == 0 {
            return Err(anyhow!("stray_data_sweeps must be at least 1"));
        }
        if self.poll_interval == 0 {
            return Err(anyhow!("poll_interval must be at least 1"));
        }
        if self.regions.iter().any(|r| r.trim().is_empty()) {
            return Err(anyhow!("region names must not be empty"));
        }
        Ok(())
    }
}

/// Load a config file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_config(path: &Path) -> Result<CleanupConfig> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read config at {}", path.display()))?;
    let config: CleanupConfig = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_slice(&bytes).context("Failed to parse config JSON")?
    } else {
        serde_yaml::from_slice(&bytes).context("Failed to parse config YAML")?
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_round_trip_and_order() {
        let sel = PassSelection::from_bits(0b1010);
        assert!(!sel.stray_data);
        assert!(sel.alignment);
        assert!(!sel.missing_code);
        assert!(sel.function_gaps);
        assert_eq!(sel.bits(), 0b1010);
        assert_eq!(sel.next_after(None), Some(Pass::Alignment));
        assert_eq!(sel.next_after(Some(Pass::Alignment)), Some(Pass::FunctionGaps));
        assert_eq!(sel.next_after(Some(Pass::FunctionGaps)), None);
        assert!(!PassSelection::none().any());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: CleanupConfig =
            serde_yaml::from_str("passes:\n  alignment: false\nregions: [\".text\"]\n").unwrap();
        assert!(cfg.passes.stray_data);
        assert!(!cfg.passes.alignment);
        assert_eq!(cfg.regions, vec![".text".to_string()]);
        assert_eq!(cfg.stray_data_sweeps, 8);
        assert_eq!(cfg.alignment, 16);
        assert_eq!(cfg.exit_name_fragments.len(), 6);
    }

    #[test]
    fn validation_rejects_odd_alignment() {
        let cfg = CleanupConfig { alignment: 12, ..CleanupConfig::default() };
        assert!(cfg.validate().is_err());
        assert!(CleanupConfig::default().validate().is_ok());
    }
}
