//! Private temporary storage for a single instance.
//!
//! Each instance receives a fresh directory tree:
//!
//! ```text
//! <root>/            engine-prefixed temp dir
//! <root>/data/       engine data directory
//! <root>/socket/     Unix socket directory
//! <root>/<config>    optional engine configuration file
//! ```
//!
//! When the server runs as a service account the root is opened up to
//! `0711` and both subdirectories are handed to that account, so the
//! service can traverse into its own directories but cannot list the root.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, chown};
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir};
use thiserror::Error;
use tracing::debug;

use crate::identity::ExecutionIdentity;

pub(crate) const STORAGE_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::storage");

/// Name of the data directory under the storage root.
pub const DATA_DIR: &str = "data";
/// Name of the socket directory under the storage root.
pub const SOCKET_DIR: &str = "socket";

const ROOT_MODE_FOR_SERVICE: u32 = 0o711;
const CONFIG_FILE_MODE: u32 = 0o644;

/// Errors raised while preparing storage.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The temporary root could not be created.
    #[error("failed to create temporary directory under '{parent}': {source}")]
    CreateRoot {
        /// Directory the root was created in.
        parent: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A directory or file inside the root could not be prepared.
    #[error("failed to prepare '{path}': {source}")]
    Prepare {
        /// Path being prepared.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Parameters for [`StorageLayout::provision`].
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    /// Prefix for the root directory name.
    pub prefix: &'a str,
    /// Directory to create the root in; the system temp dir when `None`.
    pub parent: Option<&'a Path>,
    /// Mode applied to the data and socket directories.
    pub mode: u32,
    /// Identity the server will run as.
    pub identity: &'a ExecutionIdentity,
}

/// Directory tree owned by one instance.
///
/// Dropping the layout removes the tree; [`StorageLayout::remove`] does the
/// same while reporting failures.
#[derive(Debug)]
pub struct StorageLayout {
    root: TempDir,
    data_dir: PathBuf,
    socket_dir: PathBuf,
    config_file: Option<PathBuf>,
}

impl StorageLayout {
    /// Creates a unique root with data and socket subdirectories.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when any directory cannot be created or
    /// its permissions or ownership cannot be applied. Partially created
    /// trees are removed before returning.
    pub fn provision(request: &ProvisionRequest<'_>) -> Result<Self, ProvisionError> {
        let parent = request
            .parent
            .map_or_else(std::env::temp_dir, Path::to_path_buf);
        let root = Builder::new()
            .prefix(request.prefix)
            .tempdir_in(&parent)
            .map_err(|source| ProvisionError::CreateRoot { parent, source })?;

        let data_dir = root.path().join(DATA_DIR);
        let socket_dir = root.path().join(SOCKET_DIR);
        for directory in [&data_dir, &socket_dir] {
            create_with_mode(directory, request.mode)?;
        }

        if let Some((uid, gid)) = request.identity.credentials() {
            set_mode(root.path(), ROOT_MODE_FOR_SERVICE)?;
            for directory in [&data_dir, &socket_dir] {
                chown(directory, Some(uid), Some(gid)).map_err(|source| {
                    ProvisionError::Prepare {
                        path: directory.clone(),
                        source,
                    }
                })?;
            }
        }

        debug!(
            target: STORAGE_TARGET,
            root = %root.path().display(),
            mode = format_args!("{:o}", request.mode),
            account = request.identity.name(),
            "storage provisioned"
        );
        Ok(Self {
            root,
            data_dir,
            socket_dir,
            config_file: None,
        })
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Engine data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding the server's Unix socket.
    #[must_use]
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Engine configuration file, once written.
    #[must_use]
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Writes a world-readable configuration file at the root.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Prepare`] when the file cannot be written.
    pub fn write_config_file(
        &mut self,
        name: &str,
        contents: &str,
    ) -> Result<&Path, ProvisionError> {
        let path = self.root.path().join(name);
        let prepare = |source| ProvisionError::Prepare {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(CONFIG_FILE_MODE)
            .open(&path)
            .map_err(prepare)?;
        file.write_all(contents.as_bytes()).map_err(prepare)?;
        // The umask may have narrowed the creation mode.
        set_mode(&path, CONFIG_FILE_MODE)?;
        Ok(self.config_file.insert(path).as_path())
    }

    /// Removes the tree, reporting rather than ignoring failures.
    ///
    /// # Errors
    ///
    /// Returns the IO error raised while deleting the tree.
    pub fn remove(self) -> io::Result<()> {
        let root = self.root.path().to_path_buf();
        self.root.close()?;
        debug!(target: STORAGE_TARGET, root = %root.display(), "storage removed");
        Ok(())
    }
}

fn create_with_mode(path: &Path, mode: u32) -> Result<(), ProvisionError> {
    fs::create_dir(path).map_err(|source| ProvisionError::Prepare {
        path: path.to_path_buf(),
        source,
    })?;
    set_mode(path, mode)
}

fn set_mode(path: &Path, mode: u32) -> Result<(), ProvisionError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        ProvisionError::Prepare {
            path: path.to_path_buf(),
            source,
        }
    })
}
