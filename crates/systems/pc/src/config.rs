//! Machine configuration
//!
//! Stored as pretty-printed JSON. A missing file yields the defaults, and
//! fields absent from an older file fall back to their default values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// DOS memory allocation strategy (INT 21h/58h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStrategy {
    /// Lowest block that is large enough
    #[default]
    FirstFit,
    /// Smallest block that is large enough
    BestFit,
    /// Highest block that is large enough; the allocation takes its tail
    LastFit,
}

impl AllocStrategy {
    /// Strategy code as reported by INT 21h/5800h
    pub fn code(self) -> u16 {
        match self {
            AllocStrategy::FirstFit => 0,
            AllocStrategy::BestFit => 1,
            AllocStrategy::LastFit => 2,
        }
    }

    /// Decode INT 21h/5801h. The high-memory bits are ignored.
    pub fn from_code(code: u16) -> Option<Self> {
        match code & 0x3F {
            0 => Some(AllocStrategy::FirstFit),
            1 => Some(AllocStrategy::BestFit),
            2 => Some(AllocStrategy::LastFit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Panic on undefined opcodes instead of raising INT 6
    pub cpu_strict: bool,
    /// Keep a call-stack trace for crash dumps
    pub trace_calls: bool,
    pub alloc_strategy: AllocStrategy,
    /// Extra `KEY=VALUE` pairs added to the program environment
    pub environment: Vec<String>,
    /// Host directory backing DOS file I/O
    pub drive_root: PathBuf,
    /// Scheduler cap on one slice of simulated time, in microseconds
    pub max_slice_us: f64,
    /// Frames per second the runner paces the display at, 0 to run
    /// unthrottled
    pub frame_rate: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_strict: false,
            trace_calls: false,
            alloc_strategy: AllocStrategy::FirstFit,
            environment: Vec::new(),
            drive_root: PathBuf::from("."),
            max_slice_us: 1000.0,
            frame_rate: 70,
        }
    }
}

impl MachineConfig {
    /// Load a configuration file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MachineConfig::default();
        assert!(!config.cpu_strict);
        assert_eq!(config.alloc_strategy, AllocStrategy::FirstFit);
        assert_eq!(config.max_slice_us, 1000.0);
        assert_eq!(config.frame_rate, 70);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: MachineConfig =
            serde_json::from_str(r#"{"alloc_strategy":"last_fit","cpu_strict":true}"#)
                .expect("valid json");
        assert_eq!(config.alloc_strategy, AllocStrategy::LastFit);
        assert!(config.cpu_strict);
        assert_eq!(config.frame_rate, 70);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config: MachineConfig =
            serde_json::from_str(r#"{"window_scale":3,"trace_calls":true}"#).expect("valid json");
        assert!(config.trace_calls);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = MachineConfig::load(Path::new("/nonexistent/xtemu-config.json"));
        assert_eq!(config, MachineConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("xtemu-config-{}.json", std::process::id()));
        let config = MachineConfig {
            environment: vec!["FOO=BAR".to_string()],
            alloc_strategy: AllocStrategy::BestFit,
            ..MachineConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(MachineConfig::load(&path), config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_strategy_codes() {
        for strategy in [
            AllocStrategy::FirstFit,
            AllocStrategy::BestFit,
            AllocStrategy::LastFit,
        ] {
            assert_eq!(AllocStrategy::from_code(strategy.code()), Some(strategy));
        }
        assert_eq!(AllocStrategy::from_code(0x80), Some(AllocStrategy::FirstFit));
        assert_eq!(AllocStrategy::from_code(3), None);
    }
}
