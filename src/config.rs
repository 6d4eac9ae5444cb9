//! Configuration for the nonce coordinator.
//!
//! Loaded from a JSON file. String values may point at environment variables with `$VAR`
//! or `${VAR}` (see [`LiteralOrEnv`]), which keeps connection strings out of the file:
//!
//! ```json
//! {
//!   "network": "eip155:8453",
//!   "store": { "type": "redis", "url": "$REDIS_URL" },
//!   "wake": { "type": "changes", "resubscribe_delay_ms": 1000 }
//! }
//! ```
//!
//! Every field is optional. The defaults are an in-memory store, the store's own change
//! feed for wake-ups, and the network named by `$NONCE_NETWORK` (or `default`).

use serde::{Deserialize, Deserializer};
use std::fs;
use std::num::NonZeroU64;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_network")]
    network: LiteralOrEnv<String>,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    wake: WakeConfig,
}

/// Which backend keeps the nonce records.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local records. Nothing is shared with other processes.
    #[default]
    Memory,
    /// Shared records in Redis (requires the `redis` feature).
    Redis { url: LiteralOrEnv<String> },
}

/// How the coordinator learns that another process released a lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WakeConfig {
    /// Subscribe to the store's unlock feed.
    Changes {
        #[serde(default = "config_defaults::default_resubscribe_delay_ms")]
        resubscribe_delay_ms: u64,
    },
    /// Retry the queue head every `interval_ms`. Zero is rejected.
    Poll { interval_ms: NonZeroU64 },
}

impl Default for WakeConfig {
    fn default() -> Self {
        WakeConfig::Changes {
            resubscribe_delay_ms: config_defaults::default_resubscribe_delay_ms(),
        }
    }
}

impl WakeConfig {
    /// Pause before subscribing again after the feed failed.
    pub fn resubscribe_delay(&self) -> Duration {
        match self {
            WakeConfig::Changes {
                resubscribe_delay_ms,
            } => Duration::from_millis(*resubscribe_delay_ms),
            WakeConfig::Poll { interval_ms } => Duration::from_millis(interval_ms.get()),
        }
    }
}

pub mod config_defaults {
    use super::LiteralOrEnv;
    use std::env;

    pub const DEFAULT_NETWORK: &str = "default";
    pub const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 1_000;

    /// Returns the default network with fallback: $NONCE_NETWORK env var -> "default"
    pub fn default_network() -> LiteralOrEnv<String> {
        let network = env::var("NONCE_NETWORK").unwrap_or_else(|_| DEFAULT_NETWORK.to_string());
        LiteralOrEnv::from_literal(network)
    }

    pub fn default_resubscribe_delay_ms() -> u64 {
        DEFAULT_RESUBSCRIBE_DELAY_MS
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: config_defaults::default_network(),
            store: StoreConfig::default(),
            wake: WakeConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Network namespace of the nonce records, e.g. `eip155:8453`.
    pub fn network(&self) -> &str {
        self.network.as_str()
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn wake(&self) -> &WakeConfig {
        &self.wake
    }

    /// Loads the config at `path`. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"redis://localhost:6379"`
/// - Simple env var: `"$REDIS_URL"`
/// - Braced env var: `"${REDIS_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    /// Returns the variable name if `s` is written as `$VAR` or `${VAR}`.
    fn env_var_name(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::env_var_name(&s) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?,
            None => s,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;
        Ok(LiteralOrEnv(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn empty_object_uses_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(matches!(config.store(), StoreConfig::Memory));
        assert_eq!(
            config.wake().resubscribe_delay(),
            Duration::from_millis(config_defaults::DEFAULT_RESUBSCRIBE_DELAY_MS)
        );
    }

    #[test]
    fn resolves_env_references() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe { env::set_var("ADMIN_NONCE_TEST_REDIS_URL", "redis://cache:6379") };
        let config: Config = serde_json::from_str(
            r#"{
                "network": "eip155:8453",
                "store": { "type": "redis", "url": "${ADMIN_NONCE_TEST_REDIS_URL}" },
                "wake": { "type": "poll", "interval_ms": 250 }
            }"#,
        )
        .unwrap();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe { env::remove_var("ADMIN_NONCE_TEST_REDIS_URL") };

        assert_eq!(config.network(), "eip155:8453");
        match config.store() {
            StoreConfig::Redis { url } => assert_eq!(url.as_str(), "redis://cache:6379"),
            other => panic!("unexpected store config {other:?}"),
        }
        assert_eq!(config.wake().resubscribe_delay(), Duration::from_millis(250));
        assert!(matches!(config.wake(), WakeConfig::Poll { interval_ms } if interval_ms.get() == 250));
    }

    #[test]
    fn missing_env_reference_is_an_error() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let result: Result<Config, _> =
            serde_json::from_str(r#"{ "network": "$ADMIN_NONCE_TEST_SURELY_UNSET" }"#);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("ADMIN_NONCE_TEST_SURELY_UNSET"), "{err}");
    }

    #[test]
    fn dollar_inside_literal_is_not_an_env_reference() {
        assert_eq!(LiteralOrEnv::<String>::env_var_name("pa$$word"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$not-a-var"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$VAR_1"), Some("VAR_1"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let result: Result<Config, _> =
            serde_json::from_str(r#"{ "wake": { "type": "poll", "interval_ms": 0 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = Config::load_from_path("/nonexistent/admin-nonce/config.json").unwrap();
        assert!(matches!(config.store(), StoreConfig::Memory));
    }
}
