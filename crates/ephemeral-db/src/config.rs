//! Supervisor and telemetry configuration.
//!
//! Both structures start from compiled-in defaults and accept overrides from
//! `EPHEMERAL_DB_*` environment variables. The overlay functions take a
//! lookup closure so callers (and tests) can supply values without touching
//! the process environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::command::IdentitySwitch;
use crate::retry::RetryPolicy;

/// Overrides the number of readiness attempts.
pub const ENV_READY_ATTEMPTS: &str = "EPHEMERAL_DB_READY_ATTEMPTS";
/// Overrides the pause between readiness attempts, in milliseconds.
pub const ENV_READY_INTERVAL_MS: &str = "EPHEMERAL_DB_READY_INTERVAL_MS";
/// Overrides the directory under which storage roots are created.
pub const ENV_TMPDIR: &str = "EPHEMERAL_DB_TMPDIR";
/// Selects how commands switch to the service identity.
pub const ENV_IDENTITY_SWITCH: &str = "EPHEMERAL_DB_IDENTITY_SWITCH";
/// Overrides the engine's service account name.
pub const ENV_SERVICE_ACCOUNT: &str = "EPHEMERAL_DB_SERVICE_ACCOUNT";
/// Overrides the name of the test database.
pub const ENV_DATABASE: &str = "EPHEMERAL_DB_DATABASE";
/// Log filter expression for [`crate::telemetry::initialise`].
pub const ENV_LOG: &str = "EPHEMERAL_DB_LOG";
/// Log output format for [`crate::telemetry::initialise`].
pub const ENV_LOG_FORMAT: &str = "EPHEMERAL_DB_LOG_FORMAT";

/// Name of the database created for each instance unless overridden.
pub const DEFAULT_DATABASE_NAME: &str = "test";
/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

const MAX_DATABASE_NAME_LEN: usize = 63;

/// Errors raised while building or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Environment variable carrying the value.
        key: &'static str,
        /// Raw value as supplied.
        value: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// The readiness policy would never attempt a connection.
    #[error("readiness attempts must be at least 1")]
    ZeroAttempts,
    /// The database name cannot be used as an unquoted SQL identifier.
    #[error(
        "invalid database name '{name}': expected 1-63 ASCII letters, digits or underscores, \
         not starting with a digit"
    )]
    InvalidDatabaseName {
        /// Rejected name.
        name: String,
    },
}

/// Settings that shape how an instance is provisioned and started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bounded retry policy applied to each readiness phase.
    pub readiness: RetryPolicy,
    /// Name of the database created for the caller.
    pub database_name: String,
    /// Parent directory for storage roots; the system temp dir when unset.
    pub temp_parent: Option<PathBuf>,
    /// Mechanism used to run commands as the service identity.
    pub identity_switch: IdentitySwitch,
    /// Replacement for the engine's service account name.
    pub service_account: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::default(),
            database_name: String::from(DEFAULT_DATABASE_NAME),
            temp_parent: None,
            identity_switch: IdentitySwitch::default(),
            service_account: None,
        }
    }
}

impl SupervisorConfig {
    /// Builds a configuration from defaults and `EPHEMERAL_DB_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable cannot be parsed or the result
    /// fails [`Self::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Applies overrides produced by `lookup` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a value cannot be parsed or the merged
    /// configuration is invalid.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_READY_ATTEMPTS) {
            let attempts = parse_value(ENV_READY_ATTEMPTS, &raw)?;
            self.readiness = self.readiness.with_attempts(attempts);
        }
        if let Some(raw) = lookup(ENV_READY_INTERVAL_MS) {
            let interval_ms = parse_value(ENV_READY_INTERVAL_MS, &raw)?;
            self.readiness = self.readiness.with_interval_ms(interval_ms);
        }
        if let Some(raw) = non_empty(lookup(ENV_TMPDIR)) {
            self.temp_parent = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup(ENV_IDENTITY_SWITCH) {
            self.identity_switch = parse_value(ENV_IDENTITY_SWITCH, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_SERVICE_ACCOUNT)) {
            self.service_account = Some(raw);
        }
        if let Some(raw) = lookup(ENV_DATABASE) {
            self.database_name = raw;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks invariants the lifecycle relies upon.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroAttempts`] for an empty readiness budget and
    /// [`ConfigError::InvalidDatabaseName`] for names that are not plain SQL
    /// identifiers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.attempts() == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !is_plain_identifier(&self.database_name) {
            return Err(ConfigError::InvalidDatabaseName {
                name: self.database_name.clone(),
            });
        }
        Ok(())
    }
}

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

/// Settings consumed by [`crate::telemetry::initialise`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    pub filter: String,
    /// Output format for emitted events.
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: String::from(DEFAULT_LOG_FILTER),
            format: LogFormat::default(),
        }
    }
}

impl TelemetryConfig {
    /// Builds telemetry settings from defaults and `EPHEMERAL_DB_LOG*`
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unknown log format.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Applies overrides produced by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unknown log format.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = non_empty(lookup(ENV_LOG)) {
            self.filter = raw;
        }
        if let Some(raw) = lookup(ENV_LOG_FORMAT) {
            self.format = parse_value(ENV_LOG_FORMAT, &raw)?;
        }
        Ok(self)
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|error: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.to_owned(),
            reason: error.to_string(),
        })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|raw| !raw.trim().is_empty())
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_DATABASE_NAME_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
