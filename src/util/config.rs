use crate::allocator::AllocatorConfig;
use crate::pglog::PgLogConfig;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_BF_THRESHOLD: &str = "PGCORE_AVL_BF_THRESHOLD";
pub const ENV_BF_FREE_PCT: &str = "PGCORE_AVL_BF_FREE_PCT";
pub const ENV_DUPS_TRACKED: &str = "PGCORE_PGLOG_DUPS_TRACKED";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Tunables for every engine in the crate. Missing sections and fields take
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgCoreConfig {
    pub allocator: AllocatorConfig,
    pub pglog: PgLogConfig,
}

impl PgCoreConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PgCoreConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, then applies `PGCORE_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides()?;
        debug!(
            "event=config_loaded path={} bf_threshold={} bf_free_pct={} dups_tracked={}",
            path.display(),
            config.allocator.bf_threshold,
            config.allocator.bf_free_pct,
            config.pglog.dups_tracked
        );
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by the `PGCORE_*` names.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = parse_override(&lookup, ENV_BF_THRESHOLD)? {
            self.allocator.bf_threshold = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_BF_FREE_PCT)? {
            self.allocator.bf_free_pct = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_DUPS_TRACKED)? {
            self.pglog.dups_tracked = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocator.bf_free_pct > 100 {
            return Err(ConfigError::InvalidValue {
                key: "allocator.bf_free_pct".into(),
                value: self.allocator.bf_free_pct.to_string(),
            });
        }
        if self.allocator.max_alloc_size_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "allocator.max_alloc_size_cap".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse_override(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    debug!("event=config_override key={key} value={parsed}");
    Ok(Some(parsed))
}
