//! Structured logging setup.
//!
//! `RUST_LOG` wins when set; otherwise the filter is built from the
//! configured default level plus per-module overrides.

use parley_settings::{LogFormat, LogLevel, LoggingSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, Default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: LogLevel,
    /// Stdout output format.
    pub format: LogFormat,
    /// Per-module level overrides (e.g. `parley_server::hub` => debug).
    pub module_levels: Vec<(String, LogLevel)>,
}

impl From<&LoggingSettings> for TelemetryConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            log_level: settings.level,
            format: settings.format,
            module_levels: settings.modules.clone(),
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,parley_server::hub=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.as_filter_str().to_string();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.as_filter_str()));
        }
        filter
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()
}
