//! Readiness sequence run between spawning the server and handing the
//! instance to the caller.
//!
//! Three phases share one [`RetryPolicy`]: reach the server through its
//! administrative target, create the test database, then connect to the
//! test database. Each attempt first checks that the server is still alive,
//! so a crashed server ends the sequence immediately instead of exhausting
//! the budget.

use tracing::{debug, info};

use crate::connection::{ConnectionError, SqlConnection};
use crate::engine::{Engine, EngineContext};
use crate::retry::{Attempt, RetryError, RetryPolicy, retry};
use crate::supervisor::{ProcessDiagnostics, ProcessFault, ServerProcess, StartupError};

pub(crate) const READINESS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::readiness");

/// Why the server never became ready.
#[derive(Debug)]
pub(crate) enum ProbeError {
    /// The server process exited or could not be polled.
    Process(ProcessFault),
    /// The server refused a connection or statement.
    Connection(ConnectionError),
    /// Every attempt in a phase failed.
    Unreachable {
        attempts: u32,
        last: ConnectionError,
    },
}

impl ProbeError {
    /// Attaches the server output captured after the process was torn down.
    pub(crate) fn into_startup_error(self, diagnostics: ProcessDiagnostics) -> StartupError {
        match self {
            Self::Process(ProcessFault::Exited(status)) => StartupError::Exited {
                status: status.to_string(),
                diagnostics,
            },
            Self::Process(ProcessFault::Monitor(source)) => StartupError::Monitor {
                source,
                diagnostics,
            },
            Self::Connection(source) => StartupError::Readiness {
                attempts: 1,
                source,
                diagnostics,
            },
            Self::Unreachable { attempts, last } => StartupError::Readiness {
                attempts,
                source: last,
                diagnostics,
            },
        }
    }
}

pub(crate) fn await_ready<E: Engine>(
    engine: &E,
    context: &EngineContext<'_>,
    process: &mut ServerProcess,
    policy: RetryPolicy,
    database: &str,
) -> Result<E::Connection, ProbeError> {
    let admin = retry(policy, |attempt| {
        check_alive(process)?;
        let connection = open_and_ping(engine, context, engine.admin_database())?;
        debug!(target: READINESS_TARGET, attempt, "server accepting connections");
        Ok(connection)
    })
    .map_err(settle)?;

    create_database(engine, context, process, policy, admin, database)?;

    let connection = retry(policy, |_| {
        check_alive(process)?;
        open_and_ping(engine, context, Some(database))
    })
    .map_err(settle)?;
    info!(
        target: READINESS_TARGET,
        engine = engine.name(),
        database,
        "database ready"
    );
    Ok(connection)
}

fn create_database<E: Engine>(
    engine: &E,
    context: &EngineContext<'_>,
    process: &mut ServerProcess,
    policy: RetryPolicy,
    admin: E::Connection,
    database: &str,
) -> Result<(), ProbeError> {
    let statement = engine.create_database_statement(database);
    let mut held = Some(admin);
    retry(policy, |attempt| {
        check_alive(process)?;
        let mut connection = match held.take() {
            Some(connection) => connection,
            None => engine
                .open(context, engine.admin_database())
                .map_err(transient)?,
        };
        match connection.execute(&statement) {
            Ok(()) => {
                held = Some(connection);
                Ok(())
            }
            Err(error) => {
                debug!(target: READINESS_TARGET, attempt, %error, "create database failed; reconnecting");
                Err(transient(error))
            }
        }
    })
    .map_err(settle)?;
    debug!(target: READINESS_TARGET, database, "test database created");

    if let Some(connection) = held
        && let Err(error) = connection.close()
    {
        debug!(target: READINESS_TARGET, %error, "failed to close administrative connection");
    }
    Ok(())
}

fn open_and_ping<E: Engine>(
    engine: &E,
    context: &EngineContext<'_>,
    database: Option<&str>,
) -> Result<E::Connection, Attempt<ProbeError>> {
    let mut connection = engine.open(context, database).map_err(transient)?;
    connection.ping().map_err(transient)?;
    Ok(connection)
}

fn check_alive(process: &mut ServerProcess) -> Result<(), Attempt<ProbeError>> {
    process
        .ensure_running()
        .map_err(|fault| Attempt::Fatal(ProbeError::Process(fault)))
}

const fn transient(error: ConnectionError) -> Attempt<ProbeError> {
    Attempt::Transient(ProbeError::Connection(error))
}

fn settle(error: RetryError<ProbeError>) -> ProbeError {
    match error {
        RetryError::Exhausted {
            attempts,
            last: ProbeError::Connection(last),
        } => ProbeError::Unreachable { attempts, last },
        other => other.into_inner(),
    }
}
