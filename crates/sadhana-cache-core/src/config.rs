//! Cache configuration management.
//!
//! Settings are stored at `~/.config/sadhana-cache/config.json`. Every field
//! has a default, so a missing or partial file is fine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sadhana-cache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides the persistent-tier directory when set
pub const CACHE_DIR_ENV: &str = "SADHANA_CACHE_DIR";

/// Default entry lifetime: 5 minutes
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;

/// Default sweep period: 60 seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default persistent-tier budget: 5 MiB, roughly a browser storage quota
pub const DEFAULT_MAX_PERSISTENT_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_ms: i64,
    pub sweep_interval_secs: u64,
    pub max_persistent_bytes: u64,
    /// Persistent-tier directory; falls back to the platform cache dir.
    pub cache_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_persistent_bytes: DEFAULT_MAX_PERSISTENT_BYTES,
            cache_dir: None,
        }
    }
}

impl CacheSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the persistent tier.
    ///
    /// Precedence: `SADHANA_CACHE_DIR`, then `cache_dir` from the file, then
    /// `<platform cache dir>/sadhana-cache`.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        self.resolve_cache_dir(std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from))
    }

    fn resolve_cache_dir(&self, env_override: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = env_override.filter(|d| !d.as_os_str().is_empty()) {
            return Ok(dir);
        }
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}
