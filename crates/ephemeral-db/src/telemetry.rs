//! Log output for test binaries that embed the supervisor.
//!
//! Lifecycle phases emit `tracing` events under `ephemeral_db::<phase>`
//! targets (`storage`, `bootstrap`, `process`, `readiness`, `instance`).
//! Nothing is printed until a subscriber is installed. Test harnesses call
//! [`initialise_from_env`] once per binary and steer output with
//! `EPHEMERAL_DB_LOG` (an `EnvFilter` directive) and
//! `EPHEMERAL_DB_LOG_FORMAT` (`compact` or `json`).

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter, time::UtcTime};

use crate::config::{ConfigError, LogFormat, TelemetryConfig};

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Proof that the global subscriber is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format chosen by whichever call installed the subscriber.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `EPHEMERAL_DB_LOG*` settings were rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The filter directive could not be parsed.
    #[error("invalid log filter '{filter}': {reason}")]
    Filter {
        /// Directive as configured.
        filter: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// Another global subscriber was installed first.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the global subscriber described by `EPHEMERAL_DB_LOG*`.
///
/// # Errors
///
/// Returns [`TelemetryError::Config`] for an unknown log format and the
/// errors of [`initialise`] otherwise.
pub fn initialise_from_env() -> Result<TelemetryHandle, TelemetryError> {
    initialise(&TelemetryConfig::from_env()?)
}

/// Installs the global subscriber on first use.
///
/// Later calls return a handle for the subscriber already installed and
/// ignore `config`, so every test in a binary may call this freely.
///
/// ```rust
/// use ephemeral_db::{LogFormat, TelemetryConfig, telemetry};
///
/// # fn main() -> Result<(), ephemeral_db::telemetry::TelemetryError> {
/// let first = telemetry::initialise(&TelemetryConfig::default())?;
/// let json = TelemetryConfig {
///     format: LogFormat::Json,
///     ..TelemetryConfig::default()
/// };
/// let second = telemetry::initialise(&json)?;
/// assert_eq!(second.format(), first.format());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable directive and
/// [`TelemetryError::Subscriber`] when something else already owns the
/// global default.
pub fn initialise(config: &TelemetryConfig) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| install(config))
        .map(|format| TelemetryHandle { format: *format })
}

fn install(config: &TelemetryConfig) -> Result<LogFormat, TelemetryError> {
    let subscriber = build_subscriber(config, io::stderr, io::stderr().is_terminal())?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(config.format)
}

/// Builds a subscriber for `config` that writes through `writer`.
pub(crate) fn build_subscriber<W>(
    config: &TelemetryConfig,
    writer: W,
    ansi: bool,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(&config.filter).map_err(|error| TelemetryError::Filter {
        filter: config.filter.clone(),
        reason: error.to_string(),
    })?;

    // Capture threads and concurrent launches are told apart by name.
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(UtcTime::rfc_3339());

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };
    Ok(subscriber)
}
