//! Throwaway database servers for integration tests.
//!
//! An [`Instance`] owns a complete, private database server: a fresh
//! temporary storage tree, a server process bound to a Unix socket inside
//! that tree, and an open connection to a dedicated test database. Starting
//! an instance walks through locating the engine binaries, resolving the
//! operating-system identity the server must run under, bootstrapping the
//! data directory, spawning the server, and polling until it accepts
//! connections. Stopping reverses the sequence and removes every file the
//! instance created.
//!
//! Two engines ship with the crate, each behind a default-on feature:
//! [`engine::postgres::Postgres`] and [`engine::mysql::Mysql`]. Additional
//! engines implement [`Engine`].
//!
//! ```no_run
//! # #[cfg(feature = "postgres")]
//! # fn main() -> Result<(), ephemeral_db::InstanceError> {
//! let mut db = ephemeral_db::start_postgres()?;
//! db.execute("CREATE TABLE widgets (id integer PRIMARY KEY)")?;
//! db.stop()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "postgres"))]
//! # fn main() {}
//! ```

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod connection;
pub mod engine;
mod error;
pub mod identity;
mod instance;
pub mod locator;
pub mod retry;
pub mod storage;
pub mod supervisor;
pub mod telemetry;

pub use command::{CommandSpec, IdentitySwitch, Invoker};
pub use config::{ConfigError, LogFormat, SupervisorConfig, TelemetryConfig};
pub use connection::{ConnectionError, DriverError, SqlConnection};
pub use engine::{ConfigFile, Engine, EngineContext, ShutdownPlan};
pub use error::{EnvironmentError, InstanceError};
pub use identity::{ExecutionIdentity, IdentityError, IdentityResolver, SystemIdentityResolver};
pub use instance::{Instance, InstanceState, Launcher};
pub use locator::{BinaryLocator, LocateError, SearchPathLocator};
pub use retry::{Attempt, RetryError, RetryPolicy};
pub use storage::{ProvisionError, StorageLayout};
pub use supervisor::{ProcessDiagnostics, ServerProcess, ShutdownError, StartupError};

/// Starts a throwaway PostgreSQL server configured from the environment.
///
/// # Errors
///
/// Returns [`InstanceError`] when any startup phase fails. Whatever was
/// created before the failure is torn down before the error is returned.
#[cfg(feature = "postgres")]
pub fn start_postgres() -> Result<Instance<engine::postgres::Postgres>, InstanceError> {
    Instance::start(engine::postgres::Postgres::default())
}

/// Starts a throwaway MySQL or MariaDB server configured from the
/// environment.
///
/// # Errors
///
/// Returns [`InstanceError`] when any startup phase fails. Whatever was
/// created before the failure is torn down before the error is returned.
#[cfg(feature = "mysql")]
pub fn start_mysql() -> Result<Instance<engine::mysql::Mysql>, InstanceError> {
    Instance::start(engine::mysql::Mysql::default())
}

/// Stops an instance if one is present.
///
/// Passing `None` is a no-op, which keeps teardown code simple when startup
/// may not have produced an instance.
///
/// # Errors
///
/// Propagates the first failure reported by [`Instance::stop`].
pub fn stop<E: Engine>(instance: Option<&mut Instance<E>>) -> Result<(), InstanceError> {
    instance.map_or(Ok(()), Instance::stop)
}
