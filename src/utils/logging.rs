//! Structured logging setup.
//!
//! Installs a global `tracing-subscriber` formatter from [`LoggingConfig`]. `RUST_LOG`
//! takes precedence over the configured level when set. Console and file output can be
//! enabled together, in which case each event is written to both.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::{MakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{GatewayError, Result};

/// Outputs selected by a [`LoggingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogTarget<'a> {
    Console,
    File(&'a Path),
    Both(&'a Path),
}

fn log_target(config: &LoggingConfig) -> Result<LogTarget<'_>> {
    match (config.console, config.file.as_deref()) {
        (true, None) => Ok(LogTarget::Console),
        (false, Some(path)) => Ok(LogTarget::File(path)),
        (true, Some(path)) => Ok(LogTarget::Both(path)),
        (false, None) => Err(GatewayError::ConfigError(
            "Logging has no output: enable console or set a file".into(),
        )),
    }
}

/// Initialise the global subscriber.
///
/// # Errors
/// Returns `GatewayError::ConfigError` if no output is enabled, the log file cannot be
/// opened, or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    match log_target(config)? {
        LogTarget::Console => install(config, std::io::stdout, true)?,
        LogTarget::File(path) => install(config, Mutex::new(open_log_file(path)?), false)?,
        LogTarget::Both(path) => {
            let file = open_log_file(path)?;
            // ANSI colours would end up in the file too
            install(config, std::io::stdout.and(Mutex::new(file)), false)?
        }
    }

    tracing::info!(service = %config.service_name, level = %config.level, "Logging initialised");
    Ok(())
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            GatewayError::ConfigError(format!("Failed to open log file {}: {e}", path.display()))
        })
}

fn install<W>(config: &LoggingConfig, writer: W, ansi: bool) -> Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| GatewayError::ConfigError(format!("Failed to install logger: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_target_selection() {
        let path = PathBuf::from("gateway.log");
        let both = LoggingConfig {
            file: Some(path.clone()),
            ..LoggingConfig::default()
        };
        let file_only = LoggingConfig {
            console: false,
            ..both.clone()
        };

        assert!(matches!(
            log_target(&LoggingConfig::default()),
            Ok(LogTarget::Console)
        ));
        assert!(matches!(log_target(&both), Ok(LogTarget::Both(p)) if p == path));
        assert!(matches!(log_target(&file_only), Ok(LogTarget::File(p)) if p == path));
    }

    #[test]
    fn test_no_output_rejected() {
        let config = LoggingConfig {
            console: false,
            file: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(GatewayError::ConfigError(_))
        ));
    }

    #[test]
    fn test_unopenable_log_file() {
        let config = LoggingConfig {
            file: Some("/nonexistent-dir/mesh-gateway.log".into()),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(GatewayError::ConfigError(_))
        ));
    }
}
