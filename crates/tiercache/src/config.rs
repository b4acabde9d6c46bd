use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiercache_core::{DEFAULT_MAX_KEY_LEN, PayloadFormat, Tier1Policy};
use tiercache_redis::RedisConfig;

use crate::resilience::ResilienceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Prefix applied to every key in both tiers. Empty means none.
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,
    /// Body encoding for Tier-2 payloads
    #[serde(default)]
    pub codec: PayloadFormat,
    #[serde(default)]
    pub tier1: Tier1Settings,
    /// Redis configuration (Tier-2)
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    /// Delete Tier-2 entries that fail to decode
    #[serde(default = "default_true")]
    pub remove_corrupt_entries: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            max_key_len: default_max_key_len(),
            codec: PayloadFormat::default(),
            tier1: Tier1Settings::default(),
            redis: RedisConfig::default(),
            resilience: ResilienceSettings::default(),
            remove_corrupt_entries: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_len == 0 {
            return Err("max_key_len must be > 0".into());
        }
        if self.namespace.len() >= self.max_key_len {
            return Err("namespace must be shorter than max_key_len".into());
        }
        if self.namespace.chars().any(char::is_control) {
            return Err("namespace must not contain control characters".into());
        }
        // Tier-1 validations
        if self.tier1.max_entries == Some(0) {
            return Err("tier1.max_entries must be > 0 when set".into());
        }
        if self.tier1.default_ttl_secs == 0 {
            return Err("tier1.default_ttl_secs must be > 0".into());
        }
        // Redis validations
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        // Resilience validations
        let r = &self.resilience;
        if r.failure_threshold == 0 {
            return Err("resilience.failure_threshold must be > 0".into());
        }
        if r.failure_window_ms == 0 || r.cooldown_ms == 0 || r.operation_timeout_ms == 0 {
            return Err("resilience windows and timeouts must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

fn default_max_key_len() -> usize {
    DEFAULT_MAX_KEY_LEN
}

fn default_true() -> bool {
    true
}

/// Local tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Settings {
    /// Capacity of the in-memory tier. Unbounded when unset.
    #[serde(default = "default_tier1_max_entries")]
    pub max_entries: Option<usize>,
    /// Interval of the background sweep of expired entries; 0 disables it
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// TTL used when a Tier-2 hit is promoted by a plain `get`
    #[serde(default = "default_tier1_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_tier1_max_entries() -> Option<usize> {
    Some(10_000)
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_tier1_ttl_secs() -> u64 {
    300
}

impl Default for Tier1Settings {
    fn default() -> Self {
        Self {
            max_entries: default_tier1_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            default_ttl_secs: default_tier1_ttl_secs(),
        }
    }
}

impl Tier1Settings {
    pub fn default_policy(&self) -> Tier1Policy {
        Tier1Policy::absolute(Duration::from_secs(self.default_ttl_secs))
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

/// Circuit breaker settings for the Tier-2 backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceSettings {
    /// Consecutive failures tolerated before switching to Tier-1-only
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Maximum gap between two failures for them to count as consecutive
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    /// How long Tier-2 is skipped before the next probe
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound on a single Tier-2 call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    30_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_operation_timeout_ms() -> u64 {
    500
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl From<&ResilienceSettings> for ResilienceConfig {
    fn from(s: &ResilienceSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            failure_window: Duration::from_millis(s.failure_window_ms),
            cooldown: Duration::from_millis(s.cooldown_ms),
            operation_timeout: Duration::from_millis(s.operation_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheSettings;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "tiercache.toml";

    pub fn load_config(path: Option<&str>) -> Result<CacheSettings, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TIERCACHE__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<CacheSettings, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
