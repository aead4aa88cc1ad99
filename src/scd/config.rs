//! Engine configuration
//!
//! Loaded from TOML, overridable from `DIMFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite database holding versions, facts and watermarks.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Attributes whose change creates a new dimension version.
    #[serde(default = "default_tracked_attributes")]
    pub tracked_attributes: Vec<String>,

    /// Retries granted to an orphaned fact before it becomes unresolvable.
    #[serde(default = "default_max_fact_retries")]
    pub max_fact_retries: u32,

    /// Upper bound on waiting for one key's writer lock (ms).
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    /// Run classification and commits on the rayon pool.
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Enable WAL mode on the database.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_db_path() -> String {
    "dimflow.db".to_string()
}

fn default_tracked_attributes() -> Vec<String> {
    vec!["card_type".to_string(), "credit_limit".to_string()]
}

fn default_max_fact_retries() -> u32 {
    3
}

fn default_commit_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tracked_attributes: default_tracked_attributes(),
            max_fact_retries: default_max_fact_retries(),
            commit_timeout_ms: default_commit_timeout_ms(),
            parallel: true,
            wal_mode: true,
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `DIMFLOW_CONFIG` (or `dimflow.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("DIMFLOW_CONFIG").unwrap_or_else(|_| "dimflow.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Apply `DIMFLOW_*` overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("DIMFLOW_DB_PATH") {
            self.db_path = path;
        }

        if let Ok(attrs) = std::env::var("DIMFLOW_TRACKED_ATTRIBUTES") {
            let attrs: Vec<String> = attrs
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            if !attrs.is_empty() {
                self.tracked_attributes = attrs;
            }
        }

        if let Ok(n) = std::env::var("DIMFLOW_MAX_FACT_RETRIES") {
            if let Ok(n) = n.parse() {
                self.max_fact_retries = n;
            }
        }

        if let Ok(ms) = std::env::var("DIMFLOW_COMMIT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.commit_timeout_ms = ms;
            }
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let config = EngineConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.tracked_attributes, config.tracked_attributes);
        assert_eq!(parsed.max_fact_retries, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: EngineConfig = toml::from_str("max_fact_retries = 7").unwrap();
        assert_eq!(parsed.max_fact_retries, 7);
        assert_eq!(parsed.commit_timeout_ms, 5_000);
        assert!(parsed.parallel);
        assert_eq!(parsed.db_path, "dimflow.db");
    }
}
