//! Runtime configuration (spec §6). Loaded from an optional TOML file, then
//! overridden by `SSH_MCP_`-prefixed environment variables. There is no
//! fixed config path for this service: if none is given, defaults apply.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{HubError, HubResult};
use crate::model::{HashAlgorithm, KnownHostsPolicy};
use crate::safety::SafetyMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub per_host_max_connections: usize,
    pub command_timeout_seconds: u64,
    pub idle_connection_ttl_seconds: u64,
    pub connection_retry_count: u32,
    pub connection_retry_delay_seconds: f64,
    pub known_hosts_policy: KnownHostsPolicy,
    pub hash_algorithm: HashAlgorithm,
    pub cache_maxsize: usize,
    pub safety_mode: SafetyMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            per_host_max_connections: 5,
            command_timeout_seconds: 30,
            idle_connection_ttl_seconds: 300,
            connection_retry_count: 3,
            connection_retry_delay_seconds: 1.0,
            known_hosts_policy: KnownHostsPolicy::Ignore,
            hash_algorithm: HashAlgorithm::Md5,
            cache_maxsize: 128,
            safety_mode: SafetyMode::Standard,
        }
    }
}

impl Config {
    /// Loads defaults, merges an optional TOML file (silently skipped if
    /// absent — there is no fixed config directory for this service), then
    /// applies `SSH_MCP_*` environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> HubResult<Self> {
        let mut config = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => toml::from_str(&contents).map_err(|e| HubError::config(format!("invalid config file {}: {e}", path.display())))?,
                Err(e) => return Err(HubError::config(format!("cannot read config file {}: {e}", path.display()))),
            },
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> HubResult<()> {
        if let Ok(v) = std::env::var("SSH_MCP_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = env_parsed::<usize>("SSH_MCP_PER_HOST_MAX_CONNECTIONS")? {
            self.per_host_max_connections = v;
        }
        if let Some(v) = env_parsed::<u64>("SSH_MCP_COMMAND_TIMEOUT_SECONDS")? {
            self.command_timeout_seconds = v;
        }
        if let Some(v) = env_parsed::<u64>("SSH_MCP_IDLE_CONNECTION_TTL_SECONDS")? {
            self.idle_connection_ttl_seconds = v;
        }
        if let Some(v) = env_parsed::<u32>("SSH_MCP_CONNECTION_RETRY_COUNT")? {
            self.connection_retry_count = v;
        }
        if let Some(v) = env_parsed::<f64>("SSH_MCP_CONNECTION_RETRY_DELAY_SECONDS")? {
            self.connection_retry_delay_seconds = v;
        }
        if let Ok(v) = std::env::var("SSH_MCP_KNOWN_HOSTS_POLICY") {
            self.known_hosts_policy = match v.to_lowercase().as_str() {
                "ignore" => KnownHostsPolicy::Ignore,
                "warn" => KnownHostsPolicy::Warn,
                "reject" => KnownHostsPolicy::Reject,
                other => return Err(HubError::config(format!("invalid known_hosts_policy: {other}"))),
            };
        }
        if let Ok(v) = std::env::var("SSH_MCP_HASH_ALGORITHM") {
            self.hash_algorithm = match v.to_lowercase().as_str() {
                "none" => HashAlgorithm::None,
                "md5" => HashAlgorithm::Md5,
                "sha256" => HashAlgorithm::Sha256,
                "both" => HashAlgorithm::Both,
                other => return Err(HubError::config(format!("invalid hash_algorithm: {other}"))),
            };
        }
        if let Some(v) = env_parsed::<usize>("SSH_MCP_CACHE_MAXSIZE")? {
            self.cache_maxsize = v;
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn idle_connection_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_connection_ttl_seconds)
    }

    pub fn connection_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.connection_retry_delay_seconds)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> HubResult<Option<T>> {
    match std::env::var(key) {
        Ok(v) => v.parse::<T>().map(Some).map_err(|_| HubError::config(format!("invalid value for {key}: {v}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.per_host_max_connections, 5);
        assert_eq!(config.command_timeout_seconds, 30);
        assert_eq!(config.idle_connection_ttl_seconds, 300);
        assert_eq!(config.connection_retry_count, 3);
        assert_eq!(config.cache_maxsize, 128);
    }

    #[test]
    fn missing_config_path_is_an_error_not_a_silent_default() {
        let result = Config::load(Some(std::path::Path::new("/nonexistent/sshhub.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn no_path_at_all_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.per_host_max_connections, 5);
    }
}
