//! PostgreSQL engine variant.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;

use super::{Engine, EngineContext, ShutdownPlan};
use crate::command::CommandSpec;
use crate::connection::ConnectionError;
use crate::locator::versioned_directories;
use crate::storage::StorageLayout;

const MARKER: &str = "initdb";
const SERVER: &str = "postgres";
const SERVICE_ACCOUNT: &str = "postgres";
const ADMIN_DATABASE: &str = "postgres";
const DIRECTORY_MODE: u32 = 0o700;
const SOCKET_FILE: &str = ".s.PGSQL.5432";

/// PostgreSQL via `initdb` and `postgres`.
///
/// The server listens only on a Unix socket inside the storage tree
/// (`-h ""`), runs with fsync disabled (`-F`), and trusts local
/// connections. It stops on `SIGINT`, PostgreSQL's fast shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Engine for Postgres {
    type Connection = ::postgres::Client;

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn storage_prefix(&self) -> &'static str {
        "pgtest"
    }

    fn marker_executable(&self) -> &'static str {
        MARKER
    }

    fn fallback_directories(&self) -> Vec<PathBuf> {
        let mut directories = versioned_directories(Path::new("/usr/lib/postgresql"), "", "bin");
        directories.extend(versioned_directories(Path::new("/usr"), "pgsql-", "bin"));
        directories
    }

    fn service_account(&self) -> &'static str {
        SERVICE_ACCOUNT
    }

    fn directory_mode(&self) -> u32 {
        DIRECTORY_MODE
    }

    fn bootstrap_command(
        &mut self,
        context: &EngineContext<'_>,
        _version: Option<&str>,
    ) -> CommandSpec {
        context
            .tool(MARKER)
            .arg("-D")
            .arg(context.layout().data_dir())
            .arg("--no-sync")
            .arg("--auth=trust")
    }

    fn start_command(&self, context: &EngineContext<'_>) -> CommandSpec {
        context
            .tool(SERVER)
            .arg("-D")
            .arg(context.layout().data_dir())
            .arg("-k")
            .arg(context.layout().socket_dir())
            .args(["-h", "", "-F"])
    }

    fn shutdown_plan(&self, _context: &EngineContext<'_>) -> ShutdownPlan {
        ShutdownPlan::Signal(Signal::SIGINT)
    }

    fn socket_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.socket_dir().join(SOCKET_FILE)
    }

    fn admin_database(&self) -> Option<&'static str> {
        Some(ADMIN_DATABASE)
    }

    fn connection_string(&self, context: &EngineContext<'_>, database: Option<&str>) -> String {
        let host = context.layout().socket_dir().to_string_lossy();
        let mut parts = vec![
            format!("host={}", quote_value(&host)),
            format!("user={}", quote_value(context.identity().name())),
        ];
        if let Some(name) = database {
            parts.push(format!("dbname={}", quote_value(name)));
        }
        parts.join(" ")
    }

    fn open(
        &self,
        context: &EngineContext<'_>,
        database: Option<&str>,
    ) -> Result<Self::Connection, ConnectionError> {
        let target = self.connection_string(context, database);
        ::postgres::Client::connect(&target, ::postgres::NoTls).map_err(|error| {
            ConnectionError::Open {
                target,
                source: Box::new(error),
            }
        })
    }

    fn create_database_statement(&self, name: &str) -> String {
        format!("CREATE DATABASE \"{name}\"")
    }
}

/// Quotes a key/value connection parameter when it contains spaces,
/// quotes, or backslashes.
fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_owned();
    }
    let escaped = value.replace('\\', r"\\").replace('\'', r"\'");
    format!("'{escaped}'")
}
