//! Engine configuration (`SPEC_FULL.md` §3).
//!
//! Built once by the embedder and passed by reference into `run`/
//! `resumeFromStore`. No ambient singleton: `CONSTELLATION_DEBUG` (§6) is
//! read once, either explicitly by the embedder or via `from_env`, never
//! polled from inside the scheduler's hot path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controls runtime type-check strictness (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    Off,
    /// Logs type-check violations but does not abort the run.
    #[default]
    Errors,
    /// Aborts the run on the first type-check violation.
    Full,
}

impl DebugMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "off" => Some(DebugMode::Off),
            "errors" => Some(DebugMode::Errors),
            "full" => Some(DebugMode::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub debug_mode: DebugMode,
    pub default_module_timeout: Duration,
    pub default_inputs_timeout: Duration,
    pub default_retry: u32,
    pub default_backoff_delay: Duration,
    /// Cap for `Exponential` backoff (`SPEC_FULL.md` §5: "a sane maximum"
    /// made concrete).
    pub max_backoff_delay: Duration,
    pub worker_pool_size: usize,
    pub json_max_bytes: usize,
    pub json_max_array_elements: usize,
    pub json_max_nesting_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug_mode: DebugMode::default(),
            default_module_timeout: Duration::from_secs(30),
            default_inputs_timeout: Duration::from_secs(30),
            default_retry: 0,
            default_backoff_delay: Duration::from_millis(100),
            max_backoff_delay: Duration::from_secs(30),
            worker_pool_size: num_cpus_fallback(),
            json_max_bytes: 100 * 1024 * 1024,
            json_max_array_elements: 1_000_000,
            json_max_nesting_depth: 50,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl EngineConfig {
    /// Read `CONSTELLATION_DEBUG` (`spec.md` §6) and fall back to
    /// documented defaults for everything else. Invalid values fall back
    /// to the default (`Errors`) rather than failing construction.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("CONSTELLATION_DEBUG") {
            if let Some(mode) = DebugMode::parse(raw.trim()) {
                config.debug_mode = mode;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_debug_mode_is_errors() {
        assert_eq!(EngineConfig::default().debug_mode, DebugMode::Errors);
    }

    #[test]
    fn from_env_parses_recognized_values() {
        std::env::set_var("CONSTELLATION_DEBUG", "full");
        assert_eq!(EngineConfig::from_env().debug_mode, DebugMode::Full);
        std::env::set_var("CONSTELLATION_DEBUG", "garbage");
        assert_eq!(EngineConfig::from_env().debug_mode, DebugMode::Errors);
        std::env::remove_var("CONSTELLATION_DEBUG");
    }

    #[test]
    fn limits_match_spec_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.json_max_bytes, 100 * 1024 * 1024);
        assert_eq!(config.json_max_array_elements, 1_000_000);
        assert_eq!(config.json_max_nesting_depth, 50);
    }
}
