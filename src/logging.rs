//! Structured logging setup.
//!
//! Records go to stderr so the `query` subcommand keeps stdout for replies.
//! Controller processes inherit the supervisor's stderr and set up the same
//! subscriber, so one log stream carries every process.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};

/// Install the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Calling this when a subscriber is already installed is not an error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let layer = match config.format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|err| {
            if err
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(Error::Configuration(format!(
                    "failed to initialize logging: {err}"
                )))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_tolerated() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
