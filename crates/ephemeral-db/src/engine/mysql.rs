//! MySQL and MariaDB engine variant.

use std::path::PathBuf;
use std::sync::OnceLock;

use ::mysql::{Conn, OptsBuilder};
use tracing::debug;

use super::{ConfigFile, Engine, EngineContext, ShutdownPlan};
use crate::command::CommandSpec;
use crate::connection::ConnectionError;
use crate::identity::ExecutionIdentity;
use crate::storage::StorageLayout;

pub(crate) const MYSQL_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::engine::mysql");

const MARKER: &str = "mysqld_safe";
const CLIENT: &str = "mysql";
const INSTALL_DB: &str = "mysql_install_db";
const ADMIN: &str = "mysqladmin";
const SERVICE_ACCOUNT: &str = "mysql";
const SUPERUSER: &str = "root";
const DIRECTORY_MODE: u32 = 0o711;
const CONFIG_FILE: &str = "my.cnf";
const SOCKET_FILE: &str = "mysql.sock";
const GENERAL_LOG: &str = "general.log";

/// Server distribution, detected from `mysql --version`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flavor {
    /// Oracle MySQL, bootstrapped with `--initialize-insecure`.
    #[default]
    Mysql,
    /// MariaDB, bootstrapped with `mysql_install_db`.
    MariaDb,
}

impl Flavor {
    /// Classifies the output of `mysql --version`.
    #[must_use]
    pub fn detect(version_output: &str) -> Self {
        if version_output.contains("MariaDB") {
            Self::MariaDb
        } else {
            Self::Mysql
        }
    }
}

/// MySQL or MariaDB via `mysqld_safe`.
///
/// The server reads a generated `my.cnf` that pins the data directory and
/// socket inside the storage tree and disables TCP networking. Shutdown goes
/// through `mysqladmin`, authenticated as whichever account the readiness
/// probe logged in with.
#[derive(Debug, Default)]
pub struct Mysql {
    flavor: Flavor,
    login: OnceLock<String>,
}

impl Mysql {
    /// Distribution detected during bootstrap.
    #[must_use]
    pub const fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Accounts tried, in order, when connecting.
    ///
    /// Modern MariaDB authenticates local accounts by socket peer
    /// credentials, which lets an unprivileged caller in as themselves but
    /// not as `root`. Older releases and Oracle MySQL accept a passwordless
    /// `root`.
    fn login_candidates<'a>(&'a self, identity: &'a ExecutionIdentity) -> Vec<&'a str> {
        if let Some(login) = self.login.get() {
            return vec![login.as_str()];
        }
        match (self.flavor, identity) {
            (Flavor::MariaDb, ExecutionIdentity::Caller { name }) if name != SUPERUSER => {
                vec![SUPERUSER, name.as_str()]
            }
            _ => vec![SUPERUSER],
        }
    }

    fn admin_login(&self) -> &str {
        self.login.get().map_or(SUPERUSER, String::as_str)
    }
}

impl Engine for Mysql {
    type Connection = Conn;

    fn name(&self) -> &'static str {
        "mysql"
    }

    fn storage_prefix(&self) -> &'static str {
        "mysqltest"
    }

    fn marker_executable(&self) -> &'static str {
        MARKER
    }

    fn service_account(&self) -> &'static str {
        SERVICE_ACCOUNT
    }

    fn directory_mode(&self) -> u32 {
        DIRECTORY_MODE
    }

    fn config_file(&self, layout: &StorageLayout) -> Option<ConfigFile> {
        let data = layout.data_dir().display();
        let socket = self.socket_path(layout);
        let log = layout.data_dir().join(GENERAL_LOG);
        Some(ConfigFile {
            name: String::from(CONFIG_FILE),
            contents: format!(
                "[mysqld]\n\
                 datadir = {data}\n\
                 socket = {socket}\n\
                 general_log_file = {log}\n\
                 general_log = 1\n\
                 skip-networking\n",
                socket = socket.display(),
                log = log.display(),
            ),
        })
    }

    fn version_probe(&self, context: &EngineContext<'_>) -> Option<CommandSpec> {
        Some(context.tool(CLIENT).arg("--version"))
    }

    fn bootstrap_command(
        &mut self,
        context: &EngineContext<'_>,
        version: Option<&str>,
    ) -> CommandSpec {
        self.flavor = version.map(Flavor::detect).unwrap_or_default();
        let datadir = format!("--datadir={}", context.layout().data_dir().display());
        match self.flavor {
            Flavor::MariaDb => context.tool(INSTALL_DB).arg(datadir),
            Flavor::Mysql => context
                .tool(MARKER)
                .arg("--initialize-insecure")
                .arg(datadir),
        }
    }

    fn start_command(&self, context: &EngineContext<'_>) -> CommandSpec {
        let config = context
            .layout()
            .config_file()
            .map_or_else(|| context.layout().root().join(CONFIG_FILE), PathBuf::from);
        context
            .tool(MARKER)
            .arg(format!("--defaults-file={}", config.display()))
    }

    fn shutdown_plan(&self, context: &EngineContext<'_>) -> ShutdownPlan {
        ShutdownPlan::AdminCommand(
            context
                .tool(ADMIN)
                .args(["-u", self.admin_login()])
                .arg("-S")
                .arg(self.socket_path(context.layout()))
                .arg("shutdown"),
        )
    }

    fn socket_path(&self, layout: &StorageLayout) -> PathBuf {
        layout.socket_dir().join(SOCKET_FILE)
    }

    fn admin_database(&self) -> Option<&'static str> {
        None
    }

    fn connection_string(&self, context: &EngineContext<'_>, database: Option<&str>) -> String {
        format!(
            "mysql://{user}@localhost/{database}?socket={socket}",
            user = self.admin_login(),
            database = database.unwrap_or_default(),
            socket = self.socket_path(context.layout()).display(),
        )
    }

    fn open(
        &self,
        context: &EngineContext<'_>,
        database: Option<&str>,
    ) -> Result<Self::Connection, ConnectionError> {
        let socket_path = self.socket_path(context.layout());
        let socket = socket_path.to_string_lossy();
        let mut last_error = None;
        for user in self.login_candidates(context.identity()) {
            let options = OptsBuilder::new()
                .user(Some(user))
                .socket(Some(&*socket))
                .db_name(database);
            match Conn::new(options) {
                Ok(connection) => {
                    if self.login.set(user.to_owned()).is_ok() {
                        debug!(target: MYSQL_TARGET, user, "mysql login established");
                    }
                    return Ok(connection);
                }
                Err(error) => last_error = Some((user, error)),
            }
        }
        Err(last_error.map_or_else(
            || ConnectionError::Open {
                target: format!("unix({socket})"),
                source: "no login candidates".into(),
            },
            |(user, error)| ConnectionError::Open {
                target: format!("{user}@unix({socket})"),
                source: Box::new(error),
            },
        ))
    }

    fn create_database_statement(&self, name: &str) -> String {
        format!("CREATE DATABASE IF NOT EXISTS `{name}`")
    }
}
