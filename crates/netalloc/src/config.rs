//! Allocator configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty or
//! missing file yields a working configuration.
//!
//! ```toml
//! reuse_after_secs = 7200
//! ipam_strategy = "BOTH"
//! max_conflict_retries = 5
//! ```

use crate::error::{AllocError, AllocResult};
use crate::ip::IpamStrategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings passed into the allocation facade at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Seconds a deallocated address cools down before it can be reused
    #[serde(default = "default_reuse_after_secs")]
    pub reuse_after_secs: u64,

    /// How many addresses (and of which versions) a port receives
    #[serde(default)]
    pub ipam_strategy: IpamStrategy,

    /// Attempts per operation when concurrent commits collide
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_reuse_after_secs() -> u64 {
    7200
}

fn default_max_conflict_retries() -> u32 {
    5
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            reuse_after_secs: default_reuse_after_secs(),
            ipam_strategy: IpamStrategy::default(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl AllocatorConfig {
    /// Reads and validates `path`; a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> AllocResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content).map_err(|e| {
                    AllocError::config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AllocError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Writes the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> AllocResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| AllocError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, content).map_err(|e| {
            AllocError::config(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// The reuse cooldown.
    pub fn reuse_after(&self) -> Duration {
        Duration::from_secs(self.reuse_after_secs)
    }

    /// Rejects settings the allocator cannot run with.
    pub fn validate(&self) -> AllocResult<()> {
        if self.max_conflict_retries == 0 {
            return Err(AllocError::config("max_conflict_retries must be > 0"));
        }
        if i64::try_from(self.reuse_after_secs).is_err() {
            return Err(AllocError::config("reuse_after_secs is out of range"));
        }
        Ok(())
    }
}
