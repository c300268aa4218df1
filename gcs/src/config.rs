//! Command-line surface of the service binary.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use gcs_shared::GcsResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal | LogLevel::Panic => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Guest Compute Service — in-guest agent for the container host.
#[derive(Debug, Parser)]
#[command(author, version, about = "Guest Compute Service")]
pub struct ServiceArgs {
    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Log file path; empty means stdout.
    #[arg(long, default_value = "")]
    pub logfile: String,

    /// Log output serialization.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Use stdin/stdout as the bridge transport (stderr carries logs).
    #[arg(long, default_value_t = false)]
    pub use_inouterr: bool,

    /// Enable protocol v4 and span sampling.
    #[arg(long, default_value_t = false)]
    pub v4: bool,

    /// Bytes reserved for the service cgroup.
    #[arg(long, default_value_t = 75 * 1024 * 1024)]
    pub root_mem_reserve_bytes: u64,

    /// Hard limit on the service cgroup.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub gcs_mem_limit_bytes: u64,

    /// vsock port to dial for the primary bridge channel.
    #[arg(long, default_value_t = 0x4000_0000)]
    pub bridge_port: u32,
}

/// Initialize the global tracing subscriber per `--loglevel`/`--logfile`/`--log-format`.
///
/// Returns a guard that must be kept alive for the process lifetime when
/// file logging is active (non-blocking writer thread).
pub fn init_tracing(args: &ServiceArgs) -> GcsResult<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.loglevel.as_filter()));

    if args.logfile.is_empty() {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match args.log_format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Text => builder.init(),
        }
        Ok(None)
    } else {
        let path = PathBuf::from(&args.logfile);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gcs.log".to_string());
        let dir = dir.map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking);
        match args.log_format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Text => builder.init(),
        }
        Ok(Some(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loglevel_filters_are_valid_env_filter_directives() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Fatal,
            LogLevel::Panic,
        ] {
            assert!(tracing_subscriber::EnvFilter::try_new(level.as_filter()).is_ok());
        }
    }
}
