//! Instance lifecycle: launch sequencing, runtime access, and teardown.

use std::path::{Path, PathBuf};

use strum::Display;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::command::{IdentitySwitch, Invoker};
use crate::config::SupervisorConfig;
use crate::connection::{ConnectionError, SqlConnection};
use crate::engine::{Engine, EngineContext};
use crate::error::InstanceError;
use crate::identity::{ExecutionIdentity, IdentityResolver, SystemIdentityResolver};
use crate::locator::{BinaryLocator, SearchPathLocator};
use crate::storage::{ProvisionRequest, StorageLayout};
use crate::supervisor::{ProcessDiagnostics, ServerProcess};

mod readiness;

pub(crate) const INSTANCE_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::instance");

/// Lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum InstanceState {
    /// Nothing has been created yet.
    Created,
    /// Storage exists and the data directory is being initialised.
    Initializing,
    /// The server process is being spawned.
    Starting,
    /// The server is running and being probed for readiness.
    AwaitingReady,
    /// The server accepts connections and the test database exists.
    Ready,
    /// Teardown is in progress.
    Stopping,
    /// Every resource has been released.
    Stopped,
    /// Startup failed; resources created so far have been released.
    Failed,
}

/// Configures and starts an [`Instance`].
///
/// The locator and identity resolver default to the host's `PATH` (plus the
/// engine's install locations) and the real user database; tests inject
/// their own.
pub struct Launcher<E: Engine> {
    engine: E,
    config: SupervisorConfig,
    locator: Option<Box<dyn BinaryLocator>>,
    resolver: Box<dyn IdentityResolver>,
}

impl<E: Engine> Launcher<E> {
    /// Creates a launcher with default configuration.
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            config: SupervisorConfig::default(),
            locator: None,
            resolver: Box::new(SystemIdentityResolver),
        }
    }

    /// Replaces the supervisor configuration.
    #[must_use]
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the executable search.
    #[must_use]
    pub fn with_locator(mut self, locator: impl BinaryLocator + 'static) -> Self {
        self.locator = Some(Box::new(locator));
        self
    }

    /// Replaces identity resolution.
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Runs the startup sequence.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] describing the first phase that failed.
    /// Storage and any server process created before the failure are
    /// released before returning.
    pub fn launch(self) -> Result<Instance<E>, InstanceError> {
        let name = self.engine.name();
        let mut state = InstanceState::Created;
        self.launch_tracked(&mut state).inspect_err(|error| {
            warn!(
                target: INSTANCE_TARGET,
                engine = name,
                phase = %state,
                error = %error,
                "instance failed to start"
            );
            advance(name, &mut state, InstanceState::Failed);
        })
    }

    fn launch_tracked(self, state: &mut InstanceState) -> Result<Instance<E>, InstanceError> {
        let Self {
            mut engine,
            config,
            locator: custom_locator,
            resolver,
        } = self;
        config.validate()?;

        let account = config
            .service_account
            .as_deref()
            .unwrap_or_else(|| engine.service_account());
        let identity = resolver.resolve(account)?;
        let locator = custom_locator.unwrap_or_else(|| default_locator(&engine));
        let bin_dir = locator.locate(engine.marker_executable())?;
        debug!(
            target: INSTANCE_TARGET,
            engine = engine.name(),
            bin_dir = %bin_dir.display(),
            identity = identity.name(),
            "environment resolved"
        );

        let mut layout = StorageLayout::provision(&ProvisionRequest {
            prefix: engine.storage_prefix(),
            parent: config.temp_parent.as_deref(),
            mode: engine.directory_mode(),
            identity: &identity,
        })?;
        if let Some(file) = engine.config_file(&layout) {
            layout.write_config_file(&file.name, &file.contents)?;
        }

        advance(engine.name(), state, InstanceState::Initializing);
        let switch = config.identity_switch;
        {
            let context = EngineContext::new(&layout, &bin_dir, &identity);
            let invoker = Invoker::new(&identity, switch, layout.root());
            bootstrap::initialise(&mut engine, &context, &invoker)?;
        }

        advance(engine.name(), state, InstanceState::Starting);
        let context = EngineContext::new(&layout, &bin_dir, &identity);
        let invoker = Invoker::new(&identity, switch, layout.root());
        let mut process = ServerProcess::spawn(&engine.start_command(&context), &invoker)?;

        advance(engine.name(), state, InstanceState::AwaitingReady);
        let connection = match readiness::await_ready(
            &engine,
            &context,
            &mut process,
            config.readiness,
            &config.database_name,
        ) {
            Ok(connection) => connection,
            Err(probe) => {
                let diagnostics = process.abort();
                return Err(probe.into_startup_error(diagnostics).into());
            }
        };

        let socket_path = engine.socket_path(&layout);
        let connection_string = engine.connection_string(&context, Some(&config.database_name));
        let root = layout.root().to_path_buf();
        advance(engine.name(), state, InstanceState::Ready);
        info!(
            target: INSTANCE_TARGET,
            engine = engine.name(),
            pid = process.id(),
            root = %root.display(),
            "instance ready"
        );
        Ok(Instance {
            engine,
            layout: Some(layout),
            process: Some(process),
            connection: Some(connection),
            identity,
            switch,
            bin_dir,
            root,
            socket_path,
            connection_string,
            database_name: config.database_name,
            state: InstanceState::Ready,
        })
    }
}

fn default_locator<E: Engine>(engine: &E) -> Box<dyn BinaryLocator> {
    Box::new(SearchPathLocator::from_env().with_fallbacks(engine.fallback_directories()))
}

fn advance(engine: &'static str, state: &mut InstanceState, next: InstanceState) {
    debug!(
        target: INSTANCE_TARGET,
        engine,
        from = %state,
        to = %next,
        "instance state changed"
    );
    *state = next;
}

/// A running throwaway database server and its open connection.
///
/// Dropping an instance that was not stopped stops it on a best-effort
/// basis, logging any failure.
pub struct Instance<E: Engine> {
    engine: E,
    layout: Option<StorageLayout>,
    process: Option<ServerProcess>,
    connection: Option<E::Connection>,
    identity: ExecutionIdentity,
    switch: IdentitySwitch,
    bin_dir: PathBuf,
    root: PathBuf,
    socket_path: PathBuf,
    connection_string: String,
    database_name: String,
    state: InstanceState,
}

impl<E: Engine> Instance<E> {
    /// Starts an instance configured from `EPHEMERAL_DB_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when configuration is invalid or any startup
    /// phase fails.
    pub fn start(engine: E) -> Result<Self, InstanceError> {
        Launcher::new(engine)
            .with_config(SupervisorConfig::from_env()?)
            .launch()
    }

    /// Returns a launcher for customised startup.
    #[must_use]
    pub fn launcher(engine: E) -> Launcher<E> {
        Launcher::new(engine)
    }

    /// Engine driving this instance.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Storage root; removed once the instance stops.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unix socket the server listens on.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Directory holding the engine executables.
    #[must_use]
    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Identity the server runs under.
    #[must_use]
    pub const fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    /// Name of the test database.
    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Driver connection string for the test database.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Server process id while the server runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::id)
    }

    /// Open connection to the test database, until the instance stops.
    pub fn connection_mut(&mut self) -> Option<&mut E::Connection> {
        self.connection.as_mut()
    }

    /// Output the server has produced so far.
    pub fn server_diagnostics(&mut self) -> ProcessDiagnostics {
        self.process.as_mut().map_or_else(ProcessDiagnostics::default, |process| {
            process.pump();
            process.diagnostics()
        })
    }

    /// Performs a round trip on the held connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after [`Self::stop`], or the
    /// driver's failure.
    pub fn ping(&mut self) -> Result<(), InstanceError> {
        self.with_connection(SqlConnection::ping)
    }

    /// Executes `statement` on the held connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after [`Self::stop`], or the
    /// driver's failure.
    pub fn execute(&mut self, statement: &str) -> Result<(), InstanceError> {
        self.with_connection(|connection| connection.execute(statement))
    }

    fn with_connection<F>(&mut self, operation: F) -> Result<(), InstanceError>
    where
        F: FnOnce(&mut E::Connection) -> Result<(), ConnectionError>,
    {
        if let Some(process) = self.process.as_mut() {
            process.pump();
        }
        let connection = self.connection.as_mut().ok_or(ConnectionError::Closed)?;
        operation(connection).map_err(InstanceError::from)
    }

    /// Closes the connection, stops the server, and removes the storage
    /// tree.
    ///
    /// Every step runs even when an earlier one fails; the first failure is
    /// returned. Calling `stop` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first [`InstanceError`] raised by a teardown step. Storage
    /// removal failures are logged rather than returned.
    pub fn stop(&mut self) -> Result<(), InstanceError> {
        if self.state == InstanceState::Stopped {
            return Ok(());
        }
        advance(self.engine.name(), &mut self.state, InstanceState::Stopping);
        let mut first_error: Option<InstanceError> = None;

        if let Some(connection) = self.connection.take()
            && let Err(error) = connection.close()
        {
            warn!(target: INSTANCE_TARGET, error = %error, "failed to close connection");
            record(&mut first_error, error);
        }

        if let (Some(mut process), Some(layout)) = (self.process.take(), self.layout.as_ref()) {
            let context = EngineContext::new(layout, &self.bin_dir, &self.identity);
            let plan = self.engine.shutdown_plan(&context);
            let invoker = Invoker::new(&self.identity, self.switch, layout.root());
            if let Err(error) = process.shutdown(&plan, &invoker) {
                warn!(
                    target: INSTANCE_TARGET,
                    error = %error,
                    "orderly shutdown failed; killing server"
                );
                drop(process.abort());
                record(&mut first_error, error);
            }
        }

        if let Some(layout) = self.layout.take()
            && let Err(error) = layout.remove()
        {
            warn!(
                target: INSTANCE_TARGET,
                root = %self.root.display(),
                error = %error,
                "failed to remove storage"
            );
        }

        advance(self.engine.name(), &mut self.state, InstanceState::Stopped);
        info!(target: INSTANCE_TARGET, engine = self.engine.name(), "instance stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn record(slot: &mut Option<InstanceError>, error: impl Into<InstanceError>) {
    if slot.is_none() {
        *slot = Some(error.into());
    }
}

impl<E: Engine> Drop for Instance<E> {
    fn drop(&mut self) {
        if self.state == InstanceState::Stopped {
            return;
        }
        debug!(target: INSTANCE_TARGET, "instance dropped while running; stopping");
        if let Err(error) = self.stop() {
            warn!(target: INSTANCE_TARGET, error = %error, "failed to stop dropped instance");
        }
    }
}
