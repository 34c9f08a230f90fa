//! Unified error surface for starting and stopping an instance.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::identity::IdentityError;
use crate::locator::LocateError;
use crate::storage::ProvisionError;
use crate::supervisor::{ShutdownError, StartupError};

/// The host cannot run the requested engine.
///
/// Test suites typically treat this as a reason to skip rather than fail.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The engine executables are not installed.
    #[error(transparent)]
    Locate(#[from] LocateError),
    /// The identity the server must run under is unavailable.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Errors surfaced by the instance lifecycle.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Supervisor configuration was rejected.
    #[error("invalid supervisor configuration: {0}")]
    Config(#[from] ConfigError),
    /// The host environment cannot run this engine.
    #[error("environment check failed: {0}")]
    Environment(#[from] EnvironmentError),
    /// Temporary storage could not be prepared.
    #[error("failed to provision storage: {0}")]
    Provision(#[from] ProvisionError),
    /// The data directory could not be initialised.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The server did not start or never became ready.
    #[error(transparent)]
    Startup(#[from] StartupError),
    /// The server did not shut down cleanly.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// A statement or connection operation failed after startup.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl InstanceError {
    /// Reports whether the failure stems from the host lacking the engine or
    /// its service account, rather than from the supervisor itself.
    #[must_use]
    pub const fn is_environment(&self) -> bool {
        matches!(self, Self::Environment(_))
    }
}

impl From<LocateError> for InstanceError {
    fn from(error: LocateError) -> Self {
        Self::Environment(EnvironmentError::Locate(error))
    }
}

impl From<IdentityError> for InstanceError {
    fn from(error: IdentityError) -> Self {
        Self::Environment(EnvironmentError::Identity(error))
    }
}

#[cfg(test)]
mod tests;
