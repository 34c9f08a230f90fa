//! Discovery of the directory holding an engine's executables.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub(crate) const LOCATOR_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::locator");

/// Errors raised while locating engine executables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    /// No searched directory contained the marker executable.
    #[error(
        "did not find '{marker}' in {searched} searched directories; \
         is the database engine installed?"
    )]
    NotInstalled {
        /// Executable that identifies the engine installation.
        marker: String,
        /// Number of directories inspected.
        searched: usize,
    },
}

/// Finds the directory containing an engine's marker executable.
///
/// Every sibling tool the engine needs is resolved relative to the returned
/// directory.
pub trait BinaryLocator {
    /// Returns the first directory containing an executable named `marker`.
    ///
    /// # Errors
    ///
    /// Returns [`LocateError::NotInstalled`] when no directory qualifies.
    fn locate(&self, marker: &str) -> Result<PathBuf, LocateError>;
}

/// Searches an ordered list of directories, typically `PATH` followed by
/// engine-specific install locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPathLocator {
    directories: Vec<PathBuf>,
}

impl SearchPathLocator {
    /// Creates a locator over the given directories, searched in order.
    #[must_use]
    pub fn new(directories: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            directories: directories.into_iter().collect(),
        }
    }

    /// Creates a locator over the directories listed in `PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        env::var_os("PATH").map_or_else(Self::default, |path| {
            Self::new(env::split_paths(&path))
        })
    }

    /// Appends directories searched after the existing ones.
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: impl IntoIterator<Item = PathBuf>) -> Self {
        self.directories.extend(fallbacks);
        self
    }

    /// Directories in search order.
    #[must_use]
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl BinaryLocator for SearchPathLocator {
    fn locate(&self, marker: &str) -> Result<PathBuf, LocateError> {
        let directory = self
            .directories
            .iter()
            .find(|directory| is_executable(&directory.join(marker)))
            .ok_or_else(|| LocateError::NotInstalled {
                marker: marker.to_owned(),
                searched: self.directories.len(),
            })?;
        debug!(
            target: LOCATOR_TARGET,
            marker,
            directory = %directory.display(),
            "engine executables located"
        );
        Ok(directory.clone())
    }
}

/// Lists `<parent>/<prefix><version>/<leaf>` directories, newest version
/// first.
///
/// Entries whose suffix is not a dotted run of integers are ignored, as are
/// versions whose `leaf` directory does not exist. A missing `parent` yields
/// an empty list.
#[must_use]
pub fn versioned_directories(parent: &Path, prefix: &str, leaf: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(parent) else {
        return Vec::new();
    };
    let mut versions: Vec<(Vec<u32>, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let version = parse_version(name.to_str()?.strip_prefix(prefix)?)?;
            let directory = entry.path().join(leaf);
            directory.is_dir().then_some((version, directory))
        })
        .collect();
    versions.sort_by(|left, right| right.0.cmp(&left.0));
    versions.into_iter().map(|(_, directory)| directory).collect()
}

fn parse_version(raw: &str) -> Option<Vec<u32>> {
    if raw.is_empty() {
        return None;
    }
    raw.split('.').map(|part| part.parse().ok()).collect()
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn search_root() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    fn install(directory: &Path, name: &str, mode: u32) -> PathBuf {
        fs::create_dir_all(directory).expect("create directory");
        let path = directory.join(name);
        File::create(&path).expect("create executable");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("set mode");
        path
    }

    #[rstest]
    fn returns_the_first_directory_with_the_marker(search_root: TempDir) {
        let first = search_root.path().join("first");
        let second = search_root.path().join("second");
        install(&first, "psql", 0o755);
        install(&second, "initdb", 0o755);
        let third = search_root.path().join("third");
        install(&third, "initdb", 0o755);

        let locator = SearchPathLocator::new([first, second.clone(), third]);

        assert_eq!(locator.locate("initdb"), Ok(second));
    }

    #[rstest]
    fn skips_files_without_execute_permission(search_root: TempDir) {
        let plain = search_root.path().join("plain");
        let runnable = search_root.path().join("runnable");
        install(&plain, "initdb", 0o644);
        install(&runnable, "initdb", 0o700);

        let locator = SearchPathLocator::new([plain, runnable.clone()]);

        assert_eq!(locator.locate("initdb"), Ok(runnable));
    }

    #[rstest]
    fn skips_directories_named_like_the_marker(search_root: TempDir) {
        let decoy = search_root.path().join("decoy");
        fs::create_dir_all(decoy.join("mysqld_safe")).expect("create decoy");

        let locator = SearchPathLocator::new([decoy]);

        assert_eq!(
            locator.locate("mysqld_safe"),
            Err(LocateError::NotInstalled {
                marker: String::from("mysqld_safe"),
                searched: 1,
            })
        );
    }

    #[test]
    fn fallbacks_are_searched_last() {
        let locator = SearchPathLocator::new([PathBuf::from("/usr/bin")])
            .with_fallbacks([PathBuf::from("/opt/db/bin")]);

        assert_eq!(
            locator.directories(),
            [PathBuf::from("/usr/bin"), PathBuf::from("/opt/db/bin")]
        );
    }

    #[rstest]
    fn versioned_directories_prefer_newest(search_root: TempDir) {
        for version in ["9.6", "16", "13", "not-a-version"] {
            fs::create_dir_all(search_root.path().join(version).join("bin"))
                .expect("create version dir");
        }
        fs::create_dir_all(search_root.path().join("17")).expect("create incomplete version");

        let found = versioned_directories(search_root.path(), "", "bin");

        let expected: Vec<PathBuf> = ["16", "13", "9.6"]
            .iter()
            .map(|version| search_root.path().join(version).join("bin"))
            .collect();
        assert_eq!(found, expected);
    }

    #[rstest]
    fn versioned_directories_respect_prefixes(search_root: TempDir) {
        for name in ["pgsql-15", "pgsql-12", "mysql-8"] {
            fs::create_dir_all(search_root.path().join(name).join("bin")).expect("create dir");
        }

        let found = versioned_directories(search_root.path(), "pgsql-", "bin");

        assert_eq!(
            found,
            [
                search_root.path().join("pgsql-15").join("bin"),
                search_root.path().join("pgsql-12").join("bin"),
            ]
        );
    }

    #[test]
    fn missing_parents_yield_nothing() {
        assert!(versioned_directories(Path::new("/nonexistent/ephemeral-db"), "", "bin").is_empty());
    }
}
