//! §3.1: structured diagnostics, grounded on the teacher's
//! `kumo-server-common::diagnostic_logging` module but trimmed to what
//! a single standalone binary needs (no multi-target log-segment
//! rotation, just an optional rolling file appender).
use clap::ValueEnum;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DiagFormat {
    Full,
    Compact,
    Pretty,
    Json,
}

pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub diag_format: DiagFormat,
    pub filter_env_var: &'static str,
    pub default_filter: &'static str,
}

/// Returned to keep the rolling-file worker guard alive for the
/// process lifetime; dropping it would silently stop flushing to disk.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

pub fn init(config: LoggingConfig) -> LoggingGuard {
    let filter = EnvFilter::try_from_env(config.filter_env_var)
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter));

    match config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "riskmaild.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false);
            match config.diag_format {
                DiagFormat::Full => builder.init(),
                DiagFormat::Compact => builder.compact().init(),
                DiagFormat::Pretty => builder.pretty().init(),
                DiagFormat::Json => builder.json().init(),
            }
            LoggingGuard(Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            match config.diag_format {
                DiagFormat::Full => builder.init(),
                DiagFormat::Compact => builder.compact().init(),
                DiagFormat::Pretty => builder.pretty().init(),
                DiagFormat::Json => builder.json().init(),
            }
            LoggingGuard(None)
        }
    }
}
