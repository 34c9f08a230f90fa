//! Engine variants and the behaviour they plug into the lifecycle.
//!
//! The lifecycle is identical for every engine; an [`Engine`] supplies the
//! pieces that differ: which executable marks an installation, which account
//! the server runs as, how the data directory is initialised, how the
//! server is started and stopped, and how clients connect.

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;

use crate::command::CommandSpec;
use crate::connection::{ConnectionError, SqlConnection};
use crate::identity::ExecutionIdentity;
use crate::storage::StorageLayout;

/// Everything an engine needs to describe commands for one instance.
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    layout: &'a StorageLayout,
    bin_dir: &'a Path,
    identity: &'a ExecutionIdentity,
}

impl<'a> EngineContext<'a> {
    /// Bundles the instance's storage, binary directory, and identity.
    #[must_use]
    pub const fn new(
        layout: &'a StorageLayout,
        bin_dir: &'a Path,
        identity: &'a ExecutionIdentity,
    ) -> Self {
        Self {
            layout,
            bin_dir,
            identity,
        }
    }

    /// Instance storage.
    #[must_use]
    pub const fn layout(&self) -> &'a StorageLayout {
        self.layout
    }

    /// Directory holding the engine executables.
    #[must_use]
    pub const fn bin_dir(&self) -> &'a Path {
        self.bin_dir
    }

    /// Identity engine commands run under.
    #[must_use]
    pub const fn identity(&self) -> &'a ExecutionIdentity {
        self.identity
    }

    /// Describes the engine executable `name`.
    #[must_use]
    pub fn tool(&self, name: &str) -> CommandSpec {
        CommandSpec::in_dir(self.bin_dir, name)
    }
}

/// A configuration file written at the storage root before bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// File name relative to the storage root.
    pub name: String,
    /// File contents.
    pub contents: String,
}

/// How a running server is asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownPlan {
    /// Deliver a signal to the server process.
    Signal(Signal),
    /// Run an administrative client as the caller, then wait for the server
    /// to exit.
    AdminCommand(CommandSpec),
}

/// Engine-specific behaviour plugged into the instance lifecycle.
pub trait Engine {
    /// Connection type produced by [`Engine::open`].
    type Connection: SqlConnection;

    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Prefix for the storage root directory name.
    fn storage_prefix(&self) -> &'static str {
        self.name()
    }

    /// Executable whose presence identifies an installation.
    fn marker_executable(&self) -> &'static str;

    /// Install locations searched after `PATH`.
    fn fallback_directories(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Account the server runs as when the caller is root.
    fn service_account(&self) -> &'static str;

    /// Mode applied to the data and socket directories.
    fn directory_mode(&self) -> u32;

    /// Configuration file to write before bootstrap, if any.
    fn config_file(&self, _layout: &StorageLayout) -> Option<ConfigFile> {
        None
    }

    /// Command whose output selects the bootstrap procedure, if any.
    fn version_probe(&self, _context: &EngineContext<'_>) -> Option<CommandSpec> {
        None
    }

    /// Command that initialises the data directory.
    ///
    /// `version` carries the output of [`Engine::version_probe`] when the
    /// engine defines one. Engines may remember what the probe revealed.
    fn bootstrap_command(&mut self, context: &EngineContext<'_>, version: Option<&str>)
    -> CommandSpec;

    /// Long-running server command.
    fn start_command(&self, context: &EngineContext<'_>) -> CommandSpec;

    /// How the running server is asked to stop.
    fn shutdown_plan(&self, context: &EngineContext<'_>) -> ShutdownPlan;

    /// Path of the server's Unix socket.
    fn socket_path(&self, layout: &StorageLayout) -> PathBuf;

    /// Database the administrative connection targets, if the engine needs
    /// one.
    fn admin_database(&self) -> Option<&'static str>;

    /// Driver connection string for `database` (or the server itself).
    fn connection_string(&self, context: &EngineContext<'_>, database: Option<&str>) -> String;

    /// Opens a connection to `database` (or the server itself).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Open`] when the server refuses or is not
    /// yet listening.
    fn open(
        &self,
        context: &EngineContext<'_>,
        database: Option<&str>,
    ) -> Result<Self::Connection, ConnectionError>;

    /// Statement creating the test database `name`.
    fn create_database_statement(&self, name: &str) -> String;
}
