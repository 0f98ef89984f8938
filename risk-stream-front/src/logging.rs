//! Tracing subscriber setup.

use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn default_level() -> String {
    "info".to_string()
}

/// Logging configuration, read from `LOG_*` environment variables
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub use_json: bool,

    /// Include file and line number
    #[serde(default)]
    pub with_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            use_json: false,
            with_location: false,
        }
    }
}

pub fn load_logging_config_from_env() -> Result<LoggingConfig, envy::Error> {
    envy::prefixed("LOG_").from_env::<LoggingConfig>()
}

/// Install the global subscriber, writing to stderr. Calling it twice is
/// harmless.
pub fn tracing_init(conf: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(conf.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if conf.use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(conf.with_location)
                    .with_line_number(conf.with_location)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(conf.with_location)
                    .with_line_number(conf.with_location)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let conf = LoggingConfig::default();
        assert_eq!(conf.level, "info");
        assert!(!conf.use_json);
    }

    #[test]
    fn test_init_twice() {
        let conf = LoggingConfig::default();
        tracing_init(&conf);
        tracing_init(&conf);
    }
}
