//! Configuration for the risk stream client.

use crate::error::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "RISK_STREAM_";

fn default_logs_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_run_id_wait_timeout_ms() -> u64 {
    10_000
}

fn default_log_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_event_bus_capacity() -> usize {
    256
}

/// Client configuration.
///
/// `api_url` and `assistant_id` are optional so that a session can be built
/// before they are known; such a session stays inert.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the graph execution service
    #[serde(default)]
    pub api_url: Option<String>,

    /// Workflow graph to run
    #[serde(default)]
    pub assistant_id: Option<String>,

    /// Sent as `X-Api-Key` when present
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL of the supplementary log server
    #[serde(default = "default_logs_url")]
    pub logs_url: String,

    /// Bounded wait for a resumed run's id
    #[serde(default = "default_run_id_wait_timeout_ms")]
    pub run_id_wait_timeout_ms: u64,

    /// Fixed delay between log stream reconnects
    #[serde(default = "default_log_reconnect_delay_ms")]
    pub log_reconnect_delay_ms: u64,

    /// Capacity of the in-process notification bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Directory for persisted step-wizard state (in-memory when unset)
    #[serde(default)]
    pub step_state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            assistant_id: None,
            api_key: None,
            logs_url: default_logs_url(),
            run_id_wait_timeout_ms: default_run_id_wait_timeout_ms(),
            log_reconnect_delay_ms: default_log_reconnect_delay_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            step_state_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `RISK_STREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<ClientConfig>()?)
    }

    /// Both the API URL and the assistant id are known (and non-blank)
    pub fn is_configured(&self) -> bool {
        self.api_base().is_some() && self.assistant().is_some()
    }

    /// API URL without a trailing slash
    pub fn api_base(&self) -> Option<&str> {
        self.api_url
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
    }

    pub fn assistant(&self) -> Option<&str> {
        self.assistant_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn logs_base(&self) -> &str {
        self.logs_url.trim_end_matches('/')
    }

    pub fn run_id_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.run_id_wait_timeout_ms)
    }

    pub fn log_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.log_reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.api_url.is_none());
        assert_eq!(config.run_id_wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.log_reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.logs_url, "http://localhost:3000");
        assert!(!config.is_configured());
    }

    #[test]
    fn test_from_iter() {
        let vars = vec![
            ("API_URL".to_string(), "http://localhost:2024/".to_string()),
            ("ASSISTANT_ID".to_string(), "agent".to_string()),
            ("RUN_ID_WAIT_TIMEOUT_MS".to_string(), "250".to_string()),
        ];
        let config: ClientConfig = envy::from_iter(vars).unwrap();
        assert!(config.is_configured());
        assert_eq!(config.api_base(), Some("http://localhost:2024"));
        assert_eq!(config.run_id_wait_timeout_ms, 250);
        assert_eq!(config.event_bus_capacity, 256);
    }

    #[test]
    fn test_blank_values_are_unconfigured() {
        let config = ClientConfig {
            api_url: Some("  ".to_string()),
            assistant_id: Some("agent".to_string()),
            ..Default::default()
        };
        assert!(!config.is_configured());
    }
}
