use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::lease::DEFAULT_LEASE_TTL;
use crate::pipeline::DEFAULT_BATCH_SIZE;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_LOCK_OWNER: &str = "ACCESSDB_LOCK_OWNER";
pub const ENV_LEASE_SECONDS: &str = "ACCESSDB_LEASE_SECONDS";
pub const ENV_BATCH_SIZE: &str = "ACCESSDB_BATCH_SIZE";
pub const ENV_LOG: &str = "ACCESSDB_LOG";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AccessConfig {
    #[serde(default)]
    pub migration: MigrationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationSection {
    pub owner: Option<String>,
    pub lease_seconds: Option<u64>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoggingSection {
    pub filter: Option<String>,
}

impl AccessConfig {
    /// Lock owner: env ACCESSDB_LOCK_OWNER > config > None.
    pub fn lock_owner(&self) -> Option<String> {
        self.lock_owner_with_lookup(|key| env::var(key).ok())
    }

    pub fn lock_owner_with_lookup<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        env_value(&lookup, ENV_LOCK_OWNER).or_else(|| {
            self.migration
                .owner
                .as_deref()
                .map(str::trim)
                .filter(|owner| !owner.is_empty())
                .map(str::to_string)
        })
    }

    /// Lease TTL: env ACCESSDB_LEASE_SECONDS > config > 900 seconds.
    pub fn lease_ttl(&self) -> Result<Duration> {
        self.lease_ttl_with_lookup(|key| env::var(key).ok())
    }

    pub fn lease_ttl_with_lookup<F>(&self, lookup: F) -> Result<Duration>
    where
        F: Fn(&str) -> Option<String>,
    {
        let seconds = match env_value(&lookup, ENV_LEASE_SECONDS) {
            Some(value) => Some(
                value
                    .parse::<u64>()
                    .with_context(|| format!("{ENV_LEASE_SECONDS} must be an integer, got `{value}`"))?,
            ),
            None => self.migration.lease_seconds,
        };
        match seconds {
            Some(0) => bail!("lease_seconds must be at least 1"),
            Some(seconds) => Ok(Duration::from_secs(seconds)),
            None => Ok(DEFAULT_LEASE_TTL),
        }
    }

    /// Batch size: env ACCESSDB_BATCH_SIZE > config > 500.
    pub fn batch_size(&self) -> Result<usize> {
        self.batch_size_with_lookup(|key| env::var(key).ok())
    }

    pub fn batch_size_with_lookup<F>(&self, lookup: F) -> Result<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        let size = match env_value(&lookup, ENV_BATCH_SIZE) {
            Some(value) => Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("{ENV_BATCH_SIZE} must be an integer, got `{value}`"))?,
            ),
            None => self.migration.batch_size,
        };
        match size {
            Some(0) => bail!("batch_size must be at least 1"),
            Some(size) => Ok(size),
            None => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    /// Log filter directive: env ACCESSDB_LOG > config > "info".
    pub fn log_filter(&self) -> String {
        self.log_filter_with_lookup(|key| env::var(key).ok())
    }

    pub fn log_filter_with_lookup<F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        env_value(&lookup, ENV_LOG)
            .or_else(|| self.logging.filter.clone())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    }
}

fn env_value<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse an AccessConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AccessConfig> {
    if !config_path.exists() {
        return Ok(AccessConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AccessConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, AccessConfig::default());
        assert_eq!(config.lease_ttl_with_lookup(no_env).expect("ttl"), DEFAULT_LEASE_TTL);
        assert_eq!(config.batch_size_with_lookup(no_env).expect("batch"), DEFAULT_BATCH_SIZE);
        assert_eq!(config.log_filter_with_lookup(no_env), "info");
        assert!(config.lock_owner_with_lookup(no_env).is_none());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[migration]
owner = "deploy-01"
lease_seconds = 120
batch_size = 50

[logging]
filter = "accessdb_core=debug"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.lock_owner_with_lookup(no_env).as_deref(), Some("deploy-01"));
        assert_eq!(
            config.lease_ttl_with_lookup(no_env).expect("ttl"),
            Duration::from_secs(120)
        );
        assert_eq!(config.batch_size_with_lookup(no_env).expect("batch"), 50);
        assert_eq!(config.log_filter_with_lookup(no_env), "accessdb_core=debug");
    }

    #[test]
    fn env_overrides_config_values() {
        let config = AccessConfig {
            migration: MigrationSection {
                owner: Some("from-config".to_string()),
                lease_seconds: Some(30),
                batch_size: Some(10),
            },
            logging: LoggingSection::default(),
        };
        let env = BTreeMap::from([
            (ENV_LOCK_OWNER, " from-env "),
            (ENV_LEASE_SECONDS, "45"),
            (ENV_BATCH_SIZE, "7"),
            (ENV_LOG, "warn"),
        ]);
        let lookup = |key: &str| env.get(key).map(|value| value.to_string());

        assert_eq!(config.lock_owner_with_lookup(lookup).as_deref(), Some("from-env"));
        assert_eq!(
            config.lease_ttl_with_lookup(lookup).expect("ttl"),
            Duration::from_secs(45)
        );
        assert_eq!(config.batch_size_with_lookup(lookup).expect("batch"), 7);
        assert_eq!(config.log_filter_with_lookup(lookup), "warn");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let config = AccessConfig::default();
        let err = config
            .batch_size_with_lookup(|key| (key == ENV_BATCH_SIZE).then(|| "lots".to_string()))
            .expect_err("must fail");
        assert!(err.to_string().contains(ENV_BATCH_SIZE));

        let zero = AccessConfig {
            migration: MigrationSection {
                lease_seconds: Some(0),
                ..MigrationSection::default()
            },
            ..AccessConfig::default()
        };
        assert!(zero.lease_ttl_with_lookup(no_env).is_err());
    }

    #[test]
    fn malformed_toml_reports_path() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[migration\nowner = 1").expect("write config");
        let err = load_config(&config_path).expect_err("must fail");
        assert!(err.to_string().contains("failed to parse"));
    }
}
