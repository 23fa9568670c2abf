//! # parley
//!
//! Conversation fan-out server binary. Loads settings, opens the message
//! database and serves `/ws` until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_server::ServerConfig;
use parley_settings::loader::{parse_log_format, validate};
use parley_settings::{LogFormat, ParleySettings};
use parley_store::{Database, SqliteMessageStore};
use parley_telemetry::{init_telemetry, TelemetryConfig};

/// Parley conversation server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time conversation fan-out server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` message database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log output format: `json` or `pretty`.
    #[arg(long, value_parser = log_format_arg)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Fold command-line flags over loaded settings.
    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref path) = self.db_path {
            settings.database.path.clone_from(path);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn log_format_arg(val: &str) -> std::result::Result<LogFormat, String> {
    parse_log_format(val).ok_or_else(|| format!("expected `json` or `pretty`, got `{val}`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_file = cli
        .settings
        .clone()
        .unwrap_or_else(parley_settings::settings_path);
    let mut settings = parley_settings::load_settings_from_path(&settings_file)
        .with_context(|| format!("Failed to load settings: {}", settings_file.display()))?;
    cli.apply(&mut settings);
    validate(&settings).context("Invalid settings")?;

    init_telemetry(&TelemetryConfig::from(&settings.logging))
        .context("Failed to initialize logging")?;

    let metrics = parley_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let db = Database::open(&settings.database.path).with_context(|| {
        format!("Failed to open database: {}", settings.database.path.display())
    })?;
    let store = Arc::new(SqliteMessageStore::new(db));

    let config = ServerConfig::from(&settings);
    let handle = parley_server::start(config, store, Some(metrics))
        .await
        .context("Failed to start server")?;

    tracing::info!(
        addr = %handle.addr(),
        db = %settings.database.path.display(),
        "parley listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down...");
    match handle.shutdown().await {
        Some(report) => tracing::info!(
            requests = report.requests,
            broadcasts = report.broadcasts,
            delivered = report.delivered,
            send_failures = report.send_failures,
            closed_at_shutdown = report.closed_at_shutdown,
            "hub stopped"
        ),
        None => tracing::warn!("hub did not report before exit"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_are_unset() {
        let cli = Cli::parse_from(["parley"]);
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);
        assert_eq!(cli.db_path, None);
        assert_eq!(cli.settings, None);
        assert_eq!(cli.log_format, None);
    }

    #[test]
    fn cli_custom_port() {
        let cli = Cli::parse_from(["parley", "--port", "8080"]);
        assert_eq!(cli.port, Some(8080));
    }

    #[test]
    fn cli_db_path() {
        let cli = Cli::parse_from(["parley", "--db-path", "/tmp/test.db"]);
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/test.db")));
    }

    #[test]
    fn cli_log_format() {
        let cli = Cli::parse_from(["parley", "--log-format", "pretty"]);
        assert_eq!(cli.log_format, Some(LogFormat::Pretty));
    }

    #[test]
    fn cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["parley", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn cli_rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["parley", "--port", "70000"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "parley",
            "--host",
            "127.0.0.1",
            "--port",
            "4000",
            "--db-path",
            "/tmp/p.db",
            "--log-format",
            "pretty",
        ]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.database.path, PathBuf::from("/tmp/p.db"));
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let cli = Cli::parse_from(["parley"]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 3200);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.logging.format, LogFormat::Json);
    }
}
