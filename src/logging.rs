//! Log output.
//!
//! Logs go to stderr so that command results on stdout can be piped. `RUST_LOG` replaces the
//! configured `log_level` when it is set.
//!
//! ```no_run
//! use vscope::config::Settings;
//! use vscope::logging::{self, OutputFormat, TracingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init(TracingConfig::from_settings(&settings)?.with_format(OutputFormat::Json))?;
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings derived from [`Settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    level: Level,
    format: OutputFormat,
}

impl TracingConfig {
    /// Use the configured `log_level`. Unknown level names are an error.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = Level::from_str(settings.log_level.trim())
            .map_err(|_| format!("Unknown log level '{}'", settings.log_level))?;
        Ok(Self {
            level,
            format: OutputFormat::default(),
        })
    }

    /// Render lines in `format`.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Default level when `RUST_LOG` is unset.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Selected rendering.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber. Calling it again after a subscriber is installed is a no-op.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(config.filter())
        .try_init()
        .or_else(|e| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(format!("Failed to install log subscriber: {e}"))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(level: &str) -> Settings {
        Settings {
            log_level: level.to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn level_comes_from_settings() {
        let config = TracingConfig::from_settings(&settings("DEBUG")).unwrap();
        assert_eq!(config.level(), Level::DEBUG);
        assert_eq!(config.format(), OutputFormat::Compact);
        assert_eq!(
            TracingConfig::from_settings(&settings("warn")).unwrap().level(),
            Level::WARN
        );
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = TracingConfig::from_settings(&settings("loud")).unwrap_err();
        assert!(err.contains("loud"), "{err}");
    }

    #[test]
    fn format_can_be_overridden() {
        let config = TracingConfig::from_settings(&settings("info"))
            .unwrap()
            .with_format(OutputFormat::Json);
        assert_eq!(config.format(), OutputFormat::Json);
    }
}
