//! Bridge configuration.
//!
//! # Responsibility
//! - Carry process-wide settings explicitly into bridge construction.
//! - Resolve settings from environment variables with safe defaults.
//!
//! # Invariants
//! - Blank or unparsable environment values fall back to defaults.
//! - A validated config has a non-empty resolver URL and a non-zero chunk size.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DID_RESOLVER_URL: &str = "https://api.elastos.io/eid";
pub const DEFAULT_READ_CHUNK_BYTES: usize = 1024;

const ENV_DID_RESOLVER: &str = "HIVEBRIDGE_DID_RESOLVER";
const ENV_DID_CACHE_DIR: &str = "HIVEBRIDGE_DID_CACHE_DIR";
const ENV_READ_CHUNK_BYTES: &str = "HIVEBRIDGE_READ_CHUNK_BYTES";
const ENV_CHALLENGE_TIMEOUT_MS: &str = "HIVEBRIDGE_CHALLENGE_TIMEOUT_MS";

/// Settings shared by every bridge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub did_resolver_url: String,
    pub did_cache_dir: PathBuf,
    /// Buffer size used by `reader_read_all`.
    pub read_chunk_bytes: usize,
    /// How long a login may wait for a challenge response; `None` waits forever.
    pub challenge_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            did_resolver_url: DEFAULT_DID_RESOLVER_URL.to_string(),
            did_cache_dir: default_did_cache_dir(),
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            challenge_timeout: None,
        }
    }
}

impl BridgeConfig {
    /// Builds a config from `HIVEBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            did_resolver_url: read(ENV_DID_RESOLVER).unwrap_or(defaults.did_resolver_url),
            did_cache_dir: read(ENV_DID_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.did_cache_dir),
            read_chunk_bytes: read(ENV_READ_CHUNK_BYTES)
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.read_chunk_bytes),
            challenge_timeout: read(ENV_CHALLENGE_TIMEOUT_MS)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.did_resolver_url.trim().is_empty() {
            return Err(ConfigError::EmptyResolverUrl);
        }
        if self.read_chunk_bytes == 0 {
            return Err(ConfigError::ZeroReadChunk);
        }
        Ok(())
    }
}

fn default_did_cache_dir() -> PathBuf {
    std::env::temp_dir().join("hivebridge").join("didCache")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyResolverUrl,
    ZeroReadChunk,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyResolverUrl => write!(f, "did resolver url must not be empty"),
            Self::ZeroReadChunk => write!(f, "read chunk size must be greater than zero"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::{BridgeConfig, ConfigError, DEFAULT_DID_RESOLVER_URL, DEFAULT_READ_CHUNK_BYTES};
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[]));
        assert_eq!(config.did_resolver_url, DEFAULT_DID_RESOLVER_URL);
        assert_eq!(config.read_chunk_bytes, DEFAULT_READ_CHUNK_BYTES);
        assert_eq!(config.challenge_timeout, None);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn reads_trimmed_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("HIVEBRIDGE_DID_RESOLVER", " https://resolver.test "),
            ("HIVEBRIDGE_READ_CHUNK_BYTES", "4096"),
            ("HIVEBRIDGE_CHALLENGE_TIMEOUT_MS", "1500"),
        ]));
        assert_eq!(config.did_resolver_url, "https://resolver.test");
        assert_eq!(config.read_chunk_bytes, 4096);
        assert_eq!(config.challenge_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("HIVEBRIDGE_DID_RESOLVER", "   "),
            ("HIVEBRIDGE_READ_CHUNK_BYTES", "0"),
            ("HIVEBRIDGE_CHALLENGE_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn validate_rejects_zero_chunk() {
        let config = BridgeConfig {
            read_chunk_bytes: 0,
            ..BridgeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroReadChunk));
    }
}
