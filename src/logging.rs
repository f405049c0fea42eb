use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::errors::{MaskError, Result};

/// Logging options, passed explicitly to [`init_logging`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Diagnostic format with target, file and line, at least `debug` level.
    pub debug: bool,
    /// Number of `-v` flags.
    pub verbosity: u8,
}

impl LogConfig {
    pub fn level(&self) -> LevelFilter {
        let level = match self.verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        if self.debug {
            level.max(LevelFilter::DEBUG)
        } else {
            level
        }
    }

    /// Default directive for this crate; `RUST_LOG` replaces it when set.
    pub fn directive(&self) -> String {
        format!("pymask={}", self.level().to_string().to_lowercase())
    }
}

/// Installs the global subscriber. Logs go to stderr.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.debug {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| MaskError::invalid_configuration(format!("logging setup failed: {e}")))
}
