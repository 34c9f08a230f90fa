//! Resolution of the operating-system identity that runs the server.
//!
//! Database servers refuse to run as the superuser. When the caller is
//! root, engine commands execute as the engine's service account instead;
//! otherwise they run as the caller.

use nix::errno::Errno;
use nix::unistd::{User, geteuid};
use thiserror::Error;
use tracing::debug;

pub(crate) const IDENTITY_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::identity");

/// Errors raised while resolving the execution identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The caller is root and the service account does not exist.
    #[error("running as root requires the '{account}' system user, which does not exist")]
    MissingServiceAccount {
        /// Account that was looked up.
        account: String,
    },
    /// The user database could not be queried.
    #[error("failed to look up user '{account}': {source}")]
    Lookup {
        /// Account or uid that was looked up.
        account: String,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
}

/// Identity under which engine commands are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionIdentity {
    /// Commands run as the calling user.
    Caller {
        /// Login name of the caller.
        name: String,
    },
    /// Commands run as a dedicated service account.
    Service {
        /// Login name of the service account.
        name: String,
        /// Numeric user id.
        uid: u32,
        /// Numeric primary group id.
        gid: u32,
    },
}

impl ExecutionIdentity {
    /// Login name commands run under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Caller { name } | Self::Service { name, .. } => name,
        }
    }

    /// Reports whether commands must switch away from the caller.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    /// Numeric `(uid, gid)` for service identities.
    #[must_use]
    pub const fn credentials(&self) -> Option<(u32, u32)> {
        match self {
            Self::Caller { .. } => None,
            Self::Service { uid, gid, .. } => Some((*uid, *gid)),
        }
    }
}

/// Decides which identity engine commands run under.
pub trait IdentityResolver {
    /// Resolves the identity given the engine's service account name.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MissingServiceAccount`] when the caller is
    /// root and `service_account` does not exist.
    fn resolve(&self, service_account: &str) -> Result<ExecutionIdentity, IdentityError>;
}

/// Resolver backed by the process's effective uid and the system user
/// database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentityResolver;

impl IdentityResolver for SystemIdentityResolver {
    fn resolve(&self, service_account: &str) -> Result<ExecutionIdentity, IdentityError> {
        let euid = geteuid();
        if euid.is_root() {
            let user = User::from_name(service_account)
                .map_err(|source| IdentityError::Lookup {
                    account: service_account.to_owned(),
                    source,
                })?
                .ok_or_else(|| IdentityError::MissingServiceAccount {
                    account: service_account.to_owned(),
                })?;
            debug!(
                target: IDENTITY_TARGET,
                account = %user.name,
                uid = user.uid.as_raw(),
                gid = user.gid.as_raw(),
                "running engine commands as service account"
            );
            return Ok(ExecutionIdentity::Service {
                name: user.name,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            });
        }

        let name = User::from_uid(euid)
            .map_err(|source| IdentityError::Lookup {
                account: euid.to_string(),
                source,
            })?
            .map(|user| user.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| euid.to_string());
        debug!(target: IDENTITY_TARGET, account = %name, "running engine commands as caller");
        Ok(ExecutionIdentity::Caller { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_reflect_the_variant() {
        let caller = ExecutionIdentity::Caller {
            name: String::from("alice"),
        };
        let service = ExecutionIdentity::Service {
            name: String::from("postgres"),
            uid: 70,
            gid: 71,
        };

        assert_eq!(caller.name(), "alice");
        assert!(!caller.is_service());
        assert_eq!(caller.credentials(), None);
        assert_eq!(service.name(), "postgres");
        assert!(service.is_service());
        assert_eq!(service.credentials(), Some((70, 71)));
    }

    #[test]
    fn unprivileged_callers_run_as_themselves() {
        if geteuid().is_root() {
            return;
        }

        let identity = SystemIdentityResolver
            .resolve("ephemeral-db-no-such-account")
            .expect("non-root callers never need the service account");

        assert!(!identity.is_service());
        assert!(!identity.name().is_empty());
    }

    #[test]
    fn root_requires_the_service_account() {
        if !geteuid().is_root() {
            return;
        }

        let error = SystemIdentityResolver
            .resolve("ephemeral-db-no-such-account")
            .expect_err("missing accounts are reported");

        assert_eq!(
            error,
            IdentityError::MissingServiceAccount {
                account: String::from("ephemeral-db-no-such-account"),
            }
        );
    }

    #[test]
    fn root_resolves_existing_accounts() {
        if !geteuid().is_root() {
            return;
        }

        let identity = SystemIdentityResolver
            .resolve("root")
            .expect("root always exists");

        assert_eq!(identity.credentials(), Some((0, 0)));
    }
}
