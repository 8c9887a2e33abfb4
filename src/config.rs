//! Scan configuration
//!
//! Statically-typed configuration for the orchestration engine. Every field
//! has a serde default so partial files load cleanly; validation runs once
//! in `ScanConfig::validate` before any work is scheduled.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Main scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Number of concurrent probe workers (0 = auto-detect CPU count)
    #[serde(default)]
    pub workers: usize,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate: RateConfig,

    /// Out-of-band interaction correlation
    #[serde(default)]
    pub interactions: InteractionsConfig,

    /// Target set storage
    #[serde(default)]
    pub targets: TargetStoreConfig,

    /// Progress reporting
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Checkpoint file to resume from (and to write on interrupt)
    #[serde(default)]
    pub resume_path: Option<PathBuf>,

    /// Use the automatic (fingerprint-driven) strategy instead of standard
    #[serde(default)]
    pub automatic_scan: bool,

    /// Disable clustering of templates with identical requests
    #[serde(default)]
    pub no_clustering: bool,

    /// Stop scheduling new units after the first recorded match
    #[serde(default)]
    pub stop_at_first_match: bool,

    /// Consecutive probe failures against one target before its remaining
    /// units are skipped (0 = never skip)
    #[serde(default = "default_max_host_errors")]
    pub max_host_errors: u32,
}

fn default_max_host_errors() -> u32 {
    30
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            rate: RateConfig::default(),
            interactions: InteractionsConfig::default(),
            targets: TargetStoreConfig::default(),
            progress: ProgressConfig::default(),
            resume_path: None,
            automatic_scan: false,
            no_clustering: false,
            stop_at_first_match: false,
            max_host_errors: default_max_host_errors(),
        }
    }
}

impl ScanConfig {
    /// Actual worker pool size
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Validate the configuration, failing fast before any unit dispatches
    pub fn validate(&self) -> Result<()> {
        self.rate.validate()?;
        if self.interactions.enabled && self.interactions.server_url.is_empty() {
            return Err(EngineError::InvalidConfig(
                "interactions enabled but no server url configured".into(),
            ));
        }
        Ok(())
    }

    /// Expand `$VAR` references in known string fields from the environment.
    ///
    /// Only the collaboration server URL and token participate; unset
    /// variables leave the value untouched.
    pub fn expand_env(&mut self) {
        expand_var(&mut self.interactions.server_url);
        expand_var(&mut self.interactions.token);
    }
}

fn expand_var(value: &mut String) {
    if let Some(name) = value.strip_prefix('$') {
        if let Ok(resolved) = std::env::var(name) {
            if !resolved.is_empty() {
                *value = resolved;
            }
        }
    }
}

/// Rate limiter configuration
///
/// `per_minute` takes precedence over `per_second` when both are set;
/// both zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum probe requests per second (0 = unset)
    pub per_second: u32,
    /// Maximum probe requests per minute (0 = unset)
    pub per_minute: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_second: 150,
            per_minute: 0,
        }
    }
}

impl RateConfig {
    /// Resolve to (ceiling, window), or None for unlimited
    pub fn ceiling(&self) -> Option<(u32, Duration)> {
        if self.per_minute > 0 {
            Some((self.per_minute, Duration::from_secs(60)))
        } else if self.per_second > 0 {
            Some((self.per_second, Duration::from_secs(1)))
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Zero ceilings resolve to unlimited, so the only invalid spec is a
        // window too narrow to pace (finer than one grant per microsecond).
        if let Some((ceiling, window)) = self.ceiling() {
            if window.as_micros() < ceiling as u128 {
                return Err(EngineError::InvalidRateSpec(format!(
                    "{} grants per {:?} cannot be paced",
                    ceiling, window
                )));
            }
        }
        Ok(())
    }
}

/// Interaction correlator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionsConfig {
    /// Enable out-of-band correlation
    pub enabled: bool,
    /// Collaboration server base URL (supports `$VAR` expansion)
    pub server_url: String,
    /// Authorization token (supports `$VAR` expansion)
    pub token: String,
    /// Poll interval in seconds
    pub poll_interval_secs: u64,
    /// Cooldown after probe completion before a pending marker may evict
    pub cooldown_secs: u64,
    /// Absolute eviction horizon for pending markers
    pub eviction_secs: u64,
    /// Maximum pending markers kept in memory
    pub cache_size: usize,
}

impl Default for InteractionsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            token: String::new(),
            poll_interval_secs: 5,
            cooldown_secs: 5,
            eviction_secs: 60,
            cache_size: 5000,
        }
    }
}

impl InteractionsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn eviction(&self) -> Duration {
        Duration::from_secs(self.eviction_secs)
    }
}

/// Target set storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStoreConfig {
    /// Targets kept in memory before spilling to the on-disk store
    pub memory_budget: usize,
    /// Spill database path (None = a fresh file under the system temp dir)
    pub spill_path: Option<PathBuf>,
}

impl Default for TargetStoreConfig {
    fn default() -> Self {
        Self {
            memory_budget: 100_000,
            spill_path: None,
        }
    }
}

/// Progress tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Stats emission interval in seconds (0 = no periodic emission)
    pub interval_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.actual_workers() >= 1);
    }

    #[test]
    fn test_rate_ceiling_precedence() {
        let rate = RateConfig {
            per_second: 10,
            per_minute: 300,
        };
        assert_eq!(rate.ceiling(), Some((300, Duration::from_secs(60))));

        let unlimited = RateConfig {
            per_second: 0,
            per_minute: 0,
        };
        assert_eq!(unlimited.ceiling(), None);
    }

    #[test]
    fn test_interactions_require_server() {
        let mut config = ScanConfig::default();
        config.interactions.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        config.interactions.server_url = "https://oob.example.com".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SCANFORGE_TEST_TOKEN", "secret-token");
        let mut config = ScanConfig::default();
        config.interactions.token = "$SCANFORGE_TEST_TOKEN".into();
        config.interactions.server_url = "$SCANFORGE_TEST_UNSET_URL".into();
        config.expand_env();
        assert_eq!(config.interactions.token, "secret-token");
        assert_eq!(config.interactions.server_url, "$SCANFORGE_TEST_UNSET_URL");
    }
}
