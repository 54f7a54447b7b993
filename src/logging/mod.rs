//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! Use the constants in [`targets`] so filters stay consistent:
//! - `proxy` - fetch orchestration, content gate, relay
//! - `dns` - resolver guard
//! - `http` - HTTP server and middleware
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `IMGSHIELD_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//!
//! # Examples
//!
//! ```no_run
//! use imgshield::logging::{init_logging, LogConfig, LogFormat, LogOutput};
//!
//! // Production setup (JSON to stdout)
//! init_logging(LogConfig::production()).unwrap();
//!
//! // Custom setup with file output
//! # let _ = LogConfig {
//! #     format: LogFormat::Json,
//! #     output: LogOutput::File("/var/log/imgshield.log".into()),
//! #     default_level: tracing::Level::INFO,
//! # };
//! ```

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log target names
pub mod targets {
    pub const PROXY: &str = "proxy";
    pub const DNS: &str = "dns";
    pub const HTTP: &str = "http";
    pub const CONFIG: &str = "config";

    pub const ALL: &[&str] = &[PROXY, DNS, HTTP, CONFIG];
}

/// Environment variable holding the primary filter
pub const LOG_ENV_VAR: &str = "IMGSHIELD_LOG";

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout, debug level
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Default filter directive: the level for everything plus each crate target.
fn default_filter(default_level: Level) -> String {
    let level = default_level.as_str().to_lowercase();
    let mut directives = vec![level.clone()];
    directives.extend(targets::ALL.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Build an EnvFilter from `IMGSHIELD_LOG`, then `RUST_LOG`, then the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV_VAR) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    Ok(EnvFilter::try_new(default_filter(default_level))?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(Mutex::new(File::create(path)?)),
    })
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup; subsequent calls return
/// [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    install(config)
}

fn install(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;

    // RFC 3339 timestamps
    let timer = UtcTime::rfc_3339();

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Initialize logging for tests, ignoring repeat calls.
pub fn init_test_logging() {
    let _ = install(LogConfig {
        format: LogFormat::Plaintext,
        output: LogOutput::Stdout,
        default_level: Level::DEBUG,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.format, LogFormat::Plaintext);
        assert_eq!(dev.default_level, Level::DEBUG);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.output, LogOutput::Stdout);
        assert_eq!(prod.default_level, Level::INFO);
    }

    #[test]
    fn test_default_filter_includes_targets() {
        let filter = default_filter(Level::WARN);
        assert!(filter.starts_with("warn,"));
        for target in targets::ALL {
            assert!(filter.contains(&format!("{target}=warn")), "{filter}");
        }
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn test_file_writer_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgshield.log");
        assert!(make_writer(&LogOutput::File(path.clone())).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_file_writer_bad_path() {
        let result = make_writer(&LogOutput::File(PathBuf::from(
            "/nonexistent-dir/imgshield/out.log",
        )));
        assert!(matches!(result, Err(LoggingError::FileCreation(_))));
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
    }
}
