use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::time::Duration;

use crate::account::AccountSettings;
use crate::ledger::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CdaConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub account: AccountFileConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    pub rpc_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:14265".to_string(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccountFileConfig {
    pub db_path: String,
    #[serde(default = "default_seed_file")]
    pub seed_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_seed_file() -> String {
    "seed.txt".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AccountFileConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/account".to_string(),
            seed_file: default_seed_file(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OracleConfig {
    /// How long before a CDA's timeout the time decider starts approving.
    pub threshold_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            threshold_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub confirm_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            confirm_interval_secs: 15,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl CdaConfig {
    /// Reads `path`, falling back to defaults when it is unreadable. A
    /// missing file is created with the defaults. Runs before logging is
    /// set up, so problems go to stderr.
    pub fn load_or_default(path: &str) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                eprintln!("Config file not found at '{}'. Writing defaults.", path);
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    eprintln!("Warning: could not write default config to '{}': {}", path, e);
                }
                return config;
            }
            Err(e) => {
                eprintln!("Error reading config: {}. Using defaults.", e);
                return Self::default();
            }
        };
        toml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("Error parsing config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, path: &str) -> io::Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }

    pub fn settings(&self) -> AccountSettings {
        AccountSettings {
            reconcile_interval: Duration::from_secs(self.reconcile.interval_secs),
            confirm_interval: Duration::from_secs(self.reconcile.confirm_interval_secs),
            retry: RetryPolicy {
                attempts: self.reconcile.retry_attempts,
                backoff: Duration::from_millis(self.reconcile.retry_backoff_ms),
            },
        }
    }

    pub fn oracle_threshold(&self) -> Duration {
        Duration::from_secs(self.oracle.threshold_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.node.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: CdaConfig = toml::from_str(
            r#"
            [node]
            rpc_url = "http://ledger:9000"

            [oracle]
            threshold_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.node.rpc_url, "http://ledger:9000");
        assert_eq!(config.node.timeout_secs, 10);
        assert_eq!(config.oracle_threshold(), Duration::from_secs(60));
        assert_eq!(config.account.seed_file, "seed.txt");
        assert_eq!(config.settings(), AccountSettings::default());
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cda.toml");
        let path = path.to_str().unwrap();

        let config = CdaConfig::load_or_default(path);
        assert_eq!(config.reconcile.retry_attempts, 3);
        assert!(std::path::Path::new(path).exists());

        let reread = CdaConfig::load_or_default(path);
        assert_eq!(reread.account.db_path, config.account.db_path);
    }

    #[test]
    fn test_unwritable_default_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("cda.toml");
        let path = path.to_str().unwrap();

        assert!(CdaConfig::default().save(path).is_err());
        let config = CdaConfig::load_or_default(path);
        assert_eq!(config.settings(), AccountSettings::default());
        assert!(!std::path::Path::new(path).exists());
    }
}
