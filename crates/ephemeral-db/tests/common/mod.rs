//! Shell-scripted engine used by the lifecycle tests.
//!
//! The fake server is `/bin/sh`. It announces readiness by creating a
//! `ready` file in the socket directory; connections succeed only while that
//! file exists, and `CREATE DATABASE` statements create a `db.<name>` file
//! so that connecting to an uncreated database fails the way a real engine
//! would.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ephemeral_db::{
    BinaryLocator, CommandSpec, ConnectionError, Engine, EngineContext, ExecutionIdentity,
    IdentityError, IdentityResolver, LocateError, RetryPolicy, ShutdownPlan, SqlConnection,
    StorageLayout, SupervisorConfig, telemetry,
};
use nix::sys::signal::Signal;
use tempfile::TempDir;

pub const READY_FILE: &str = "ready";
pub const PID_FILE: &str = "pid";
pub const STATEMENT_LOG: &str = "statements.log";

/// Server that becomes ready after a short delay and exits cleanly on
/// `SIGINT`.
pub const WELL_BEHAVED_SERVER: &str = r#"trap 'rm -f "$1/ready"; echo "shutting down"; exit 0' INT
echo $$ > "$1/pid"
echo "starting"
sleep 0.2
: > "$1/ready"
echo "ready to accept connections"
while :; do sleep 0.05; done"#;

/// Server that runs but never becomes ready.
pub const SILENT_SERVER: &str = r#"trap 'exit 0' INT
echo $$ > "$1/pid"
while :; do sleep 0.05; done"#;

/// Server that becomes ready but exits unsuccessfully when stopped.
pub const CRASHING_SERVER: &str = r#"trap 'echo "could not flush buffers" >&2; exit 3' INT
: > "$1/ready"
while :; do sleep 0.05; done"#;

/// Bootstrap that writes a marker into the data directory.
pub const BOOTSTRAP: &str = r#"echo "fake 1.0" > "$1/VERSION""#;

/// Configurable scripted engine.
#[derive(Debug, Clone)]
pub struct FakeEngine {
    pub bootstrap: &'static str,
    pub server: &'static str,
    pub admin_shutdown: bool,
    /// Touched by the server when it starts, outside the storage tree.
    pub witness: Option<PathBuf>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            bootstrap: BOOTSTRAP,
            server: WELL_BEHAVED_SERVER,
            admin_shutdown: false,
            witness: None,
        }
    }
}

fn sh(name: &str, script: &str) -> CommandSpec {
    CommandSpec::new("/bin/sh").arg("-c").arg(script).arg(name)
}

impl Engine for FakeEngine {
    type Connection = FakeConnection;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn storage_prefix(&self) -> &'static str {
        "fakedb"
    }

    fn marker_executable(&self) -> &'static str {
        "sh"
    }

    fn service_account(&self) -> &'static str {
        "root"
    }

    fn directory_mode(&self) -> u32 {
        0o700
    }

    fn bootstrap_command(&mut self, context: &EngineContext<'_>, _version: Option<&str>) -> CommandSpec {
        sh("fake-initdb", self.bootstrap).arg(context.layout().data_dir())
    }

    fn start_command(&self, context: &EngineContext<'_>) -> CommandSpec {
        let script = self.witness.as_ref().map_or_else(
            || self.server.to_owned(),
            |witness| format!(": > '{}'\n{}", witness.display(), self.server),
        );
        sh("fake-server", &script).arg(context.layout().socket_dir())
    }

    fn shutdown_plan(&self, context: &EngineContext<'_>) -> ShutdownPlan {
        if self.admin_shutdown {
            ShutdownPlan::AdminCommand(
                sh("fake-admin", r#"kill -INT "$(cat "$1/pid")""#)
                    .arg(context.layout().socket_dir()),
            )
        } else {
            ShutdownPlan::Signal(Signal::SIGINT)
        }
    }

    fn socket_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.socket_dir().join(".s.FAKE")
    }

    fn admin_database(&self) -> Option<&'static str> {
        Some("admin")
    }

    fn connection_string(&self, context: &EngineContext<'_>, database: Option<&str>) -> String {
        format!(
            "fake://{}?db={}",
            context.layout().socket_dir().display(),
            database.unwrap_or("admin")
        )
    }

    fn open(
        &self,
        context: &EngineContext<'_>,
        database: Option<&str>,
    ) -> Result<Self::Connection, ConnectionError> {
        let socket_dir = context.layout().socket_dir().to_path_buf();
        let target = self.connection_string(context, database);
        if !socket_dir.join(READY_FILE).exists() {
            return Err(ConnectionError::Open {
                target,
                source: "server not listening".into(),
            });
        }
        if let Some(name) = database.filter(|name| *name != "admin")
            && !socket_dir.join(format!("db.{name}")).exists()
        {
            return Err(ConnectionError::Open {
                target,
                source: format!("database \"{name}\" does not exist").into(),
            });
        }
        Ok(FakeConnection {
            socket_dir,
            log: context.layout().root().join(STATEMENT_LOG),
        })
    }

    fn create_database_statement(&self, name: &str) -> String {
        format!("CREATE DATABASE {name}")
    }
}

/// Connection to the scripted server.
#[derive(Debug)]
pub struct FakeConnection {
    socket_dir: PathBuf,
    log: PathBuf,
}

impl SqlConnection for FakeConnection {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        if self.socket_dir.join(READY_FILE).exists() {
            Ok(())
        } else {
            Err(ConnectionError::Ping {
                source: "server went away".into(),
            })
        }
    }

    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError> {
        let execute_error = |source: std::io::Error| ConnectionError::Execute {
            statement: statement.to_owned(),
            source: Box::new(source),
        };
        if let Some(name) = statement.strip_prefix("CREATE DATABASE ") {
            fs::write(self.socket_dir.join(format!("db.{name}")), b"").map_err(execute_error)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .map_err(execute_error)?;
        writeln!(log, "{statement}").map_err(execute_error)
    }

    fn close(self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Locator that always answers `/bin`.
#[derive(Debug, Clone, Copy)]
pub struct BinLocator;

impl BinaryLocator for BinLocator {
    fn locate(&self, _marker: &str) -> Result<PathBuf, LocateError> {
        Ok(PathBuf::from("/bin"))
    }
}

/// Resolver that keeps every command running as the test process.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity;

impl IdentityResolver for CallerIdentity {
    fn resolve(&self, _service_account: &str) -> Result<ExecutionIdentity, IdentityError> {
        Ok(ExecutionIdentity::Caller {
            name: String::from("tester"),
        })
    }
}

/// Configuration rooted in `parent` with a quick readiness policy.
pub fn config_in(parent: &Path) -> SupervisorConfig {
    SupervisorConfig {
        readiness: RetryPolicy::new(200, Duration::from_millis(20)),
        temp_parent: Some(parent.to_path_buf()),
        ..SupervisorConfig::default()
    }
}

/// Fresh directory to host storage roots.
///
/// Also installs the log subscriber, so `EPHEMERAL_DB_LOG` shows lifecycle
/// events for any test that fails.
pub fn parent_dir() -> TempDir {
    telemetry::initialise_from_env().expect("telemetry settings are valid");
    TempDir::new().expect("create parent dir")
}

/// Whether `parent` holds no storage roots.
pub fn is_empty(parent: &Path) -> bool {
    fs::read_dir(parent)
        .expect("read parent dir")
        .next()
        .is_none()
}
