//! One-shot data directory initialisation.
//!
//! Bootstrap runs the engine's optional version probe, then its bootstrap
//! command, both to completion with combined output captured. Any failure
//! carries that output so the caller sees what the engine tool printed.

use std::io;
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandSpec, Invoker};
use crate::engine::{Engine, EngineContext};

pub(crate) const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::bootstrap");

/// Errors raised while initialising the data directory.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A bootstrap tool could not be executed at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The version probe exited unsuccessfully.
    #[error("failed to determine engine version: {program} {status} -> {output}")]
    VersionProbe {
        /// Probe program.
        program: String,
        /// Exit status description.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },
    /// The bootstrap command exited unsuccessfully.
    #[error("failed to initialise database: {program} {status} -> {output}")]
    Failed {
        /// Bootstrap program.
        program: String,
        /// Exit status description.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },
}

/// Exit status and combined output of a command run to completion.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Stdout followed by stderr, lossily decoded.
    pub combined: String,
}

/// Runs `command` to completion with stdin closed, capturing its output.
///
/// # Errors
///
/// Returns the IO error raised when the command cannot be started or
/// waited upon.
pub fn run_captured(mut command: Command) -> io::Result<CapturedOutput> {
    let output = command.stdin(Stdio::null()).output()?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CapturedOutput {
        status: output.status,
        combined,
    })
}

/// Initialises the data directory for `engine`.
///
/// # Errors
///
/// Returns [`BootstrapError`] when either command cannot run or exits
/// unsuccessfully. The server is never started after a failure here.
pub fn initialise<E: Engine>(
    engine: &mut E,
    context: &EngineContext<'_>,
    invoker: &Invoker<'_>,
) -> Result<(), BootstrapError> {
    let version = engine
        .version_probe(context)
        .map(|probe| run_version_probe(&probe, invoker))
        .transpose()?;

    let spec = engine.bootstrap_command(context, version.as_deref());
    let program = spec.display_name();
    info!(
        target: BOOTSTRAP_TARGET,
        engine = engine.name(),
        program = %program,
        data_dir = %context.layout().data_dir().display(),
        "initialising data directory"
    );
    let output = run_captured(invoker.command(&spec))
        .map_err(|source| BootstrapError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(BootstrapError::Failed {
            program,
            status: output.status.to_string(),
            output: output.combined,
        });
    }
    debug!(target: BOOTSTRAP_TARGET, output = %output.combined.trim_end(), "bootstrap finished");
    Ok(())
}

fn run_version_probe(probe: &CommandSpec, invoker: &Invoker<'_>) -> Result<String, BootstrapError> {
    let program = probe.display_name();
    let output = run_captured(invoker.command(probe)).map_err(|source| BootstrapError::Spawn {
        program: program.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(BootstrapError::VersionProbe {
            program,
            status: output.status.to_string(),
            output: output.combined,
        });
    }
    debug!(
        target: BOOTSTRAP_TARGET,
        program = %program,
        version = %output.combined.trim_end(),
        "engine version probed"
    );
    Ok(output.combined)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::command::IdentitySwitch;
    use crate::connection::{ConnectionError, SqlConnection};
    use crate::engine::ShutdownPlan;
    use crate::identity::ExecutionIdentity;
    use crate::storage::{ProvisionRequest, StorageLayout};

    struct NoConnection;

    impl SqlConnection for NoConnection {
        fn ping(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn execute(&mut self, _statement: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn close(self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    /// Engine whose tools are shell snippets.
    #[derive(Default)]
    struct ScriptEngine {
        probe: Option<&'static str>,
        bootstrap: &'static str,
        seen_version: Option<String>,
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    impl Engine for ScriptEngine {
        type Connection = NoConnection;

        fn name(&self) -> &'static str {
            "script"
        }

        fn marker_executable(&self) -> &'static str {
            "sh"
        }

        fn service_account(&self) -> &'static str {
            "nobody"
        }

        fn directory_mode(&self) -> u32 {
            0o700
        }

        fn version_probe(&self, _context: &EngineContext<'_>) -> Option<CommandSpec> {
            self.probe.map(sh)
        }

        fn bootstrap_command(
            &mut self,
            context: &EngineContext<'_>,
            version: Option<&str>,
        ) -> CommandSpec {
            self.seen_version = version.map(str::to_owned);
            sh(self.bootstrap)
                .arg("bootstrap")
                .arg(context.layout().data_dir())
        }

        fn start_command(&self, _context: &EngineContext<'_>) -> CommandSpec {
            sh("exit 0")
        }

        fn shutdown_plan(&self, _context: &EngineContext<'_>) -> ShutdownPlan {
            ShutdownPlan::Signal(nix::sys::signal::Signal::SIGTERM)
        }

        fn socket_path(&self, layout: &StorageLayout) -> PathBuf {
            layout.socket_dir().join("socket")
        }

        fn admin_database(&self) -> Option<&'static str> {
            None
        }

        fn connection_string(&self, _context: &EngineContext<'_>, _database: Option<&str>) -> String {
            String::new()
        }

        fn open(
            &self,
            _context: &EngineContext<'_>,
            _database: Option<&str>,
        ) -> Result<Self::Connection, ConnectionError> {
            Ok(NoConnection)
        }

        fn create_database_statement(&self, name: &str) -> String {
            format!("CREATE DATABASE {name}")
        }
    }

    struct Workspace {
        _parent: TempDir,
        layout: StorageLayout,
        identity: ExecutionIdentity,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let parent = TempDir::new().expect("create parent dir");
        let identity = ExecutionIdentity::Caller {
            name: String::from("tester"),
        };
        let layout = StorageLayout::provision(&ProvisionRequest {
            prefix: "script",
            parent: Some(parent.path()),
            mode: 0o700,
            identity: &identity,
        })
        .expect("provision storage");
        Workspace {
            _parent: parent,
            layout,
            identity,
        }
    }

    fn run(engine: &mut ScriptEngine, workspace: &Workspace) -> Result<(), BootstrapError> {
        let context = EngineContext::new(&workspace.layout, Path::new("/bin"), &workspace.identity);
        let invoker = Invoker::new(
            &workspace.identity,
            IdentitySwitch::Credentials,
            workspace.layout.root(),
        );
        initialise(engine, &context, &invoker)
    }

    #[rstest]
    fn successful_bootstrap_writes_into_the_data_directory(workspace: Workspace) {
        let mut engine = ScriptEngine {
            bootstrap: r#"echo initialised > "$1/VERSION""#,
            ..ScriptEngine::default()
        };

        run(&mut engine, &workspace).expect("bootstrap succeeds");

        assert!(workspace.layout.data_dir().join("VERSION").is_file());
        assert_eq!(engine.seen_version, None);
    }

    #[rstest]
    fn probe_output_reaches_the_bootstrap_choice(workspace: Workspace) {
        let mut engine = ScriptEngine {
            probe: Some("echo 'mysql  Ver 15.1 Distrib 10.11.6-MariaDB'"),
            bootstrap: "exit 0",
            ..ScriptEngine::default()
        };

        run(&mut engine, &workspace).expect("bootstrap succeeds");

        let version = engine.seen_version.expect("probe output recorded");
        assert!(version.contains("MariaDB"), "version: {version}");
    }

    #[rstest]
    fn failed_probes_stop_before_bootstrap(workspace: Workspace) {
        let mut engine = ScriptEngine {
            probe: Some("echo 'mysql: not configured' >&2; exit 2"),
            bootstrap: r#"touch "$1/should-not-exist""#,
            ..ScriptEngine::default()
        };

        let error = run(&mut engine, &workspace).expect_err("probe fails");

        match error {
            BootstrapError::VersionProbe { output, .. } => {
                assert!(output.contains("not configured"), "output: {output}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!workspace.layout.data_dir().join("should-not-exist").exists());
    }

    #[rstest]
    fn failed_bootstraps_report_combined_output(workspace: Workspace) {
        let mut engine = ScriptEngine {
            bootstrap: "echo 'creating directories'; echo 'initdb: could not create' >&2; exit 1",
            ..ScriptEngine::default()
        };

        let error = run(&mut engine, &workspace).expect_err("bootstrap fails");

        let rendered = error.to_string();
        assert!(rendered.starts_with("failed to initialise database"), "{rendered}");
        assert!(rendered.contains("creating directories"), "{rendered}");
        assert!(rendered.contains("initdb: could not create"), "{rendered}");
    }

    #[test]
    fn run_captured_concatenates_streams() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "printf out; printf err >&2"]);

        let output = run_captured(command).expect("sh runs");

        assert!(output.status.success());
        assert_eq!(output.combined, "outerr");
    }

    #[test]
    fn missing_programs_fail_to_spawn() {
        let error = run_captured(Command::new("/nonexistent/ephemeral-db/initdb"))
            .expect_err("program does not exist");

        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
