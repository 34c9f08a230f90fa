//! Engine command descriptions and their translation into processes.
//!
//! Engines describe commands as a [`CommandSpec`]: a program and its
//! arguments, independent of who runs it. [`CommandSpec::build`] turns a
//! description into a [`std::process::Command`] that runs as the resolved
//! [`ExecutionIdentity`], switching identity either through process
//! credentials or by wrapping the command line in `su`.

pub mod shell;

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::identity::ExecutionIdentity;

const SU_PROGRAM: &str = "su";

/// How commands switch to a service identity when the caller is root.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum IdentitySwitch {
    /// Set the child's uid and gid directly before exec.
    #[default]
    Credentials,
    /// Run `su - <account> -c <quoted command line>`.
    Su,
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpec {
    /// Describes `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Describes `name` resolved inside `bin_dir`.
    #[must_use]
    pub fn in_dir(bin_dir: &Path, name: &str) -> Self {
        Self::new(bin_dir.join(name))
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments in order.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Short program name used in logs and error messages.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or_else(|| self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Renders the command as a single shell-quoted line, byte for byte.
    #[must_use]
    pub fn shell_line(&self) -> OsString {
        shell::join(
            std::iter::once(self.program.as_os_str())
                .chain(self.args.iter().map(OsString::as_os_str)),
        )
    }

    /// Builds a command that runs as the caller, without identity switching.
    #[must_use]
    pub fn to_command(&self, working_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(working_dir);
        command
    }

    /// Builds a command that runs as `identity`.
    ///
    /// Caller identities run the program directly. Service identities run it
    /// with the account's uid and gid, or through `su` when `switch` asks
    /// for it. The working directory must be traversable by the identity.
    #[must_use]
    pub fn build(
        &self,
        identity: &ExecutionIdentity,
        switch: IdentitySwitch,
        working_dir: &Path,
    ) -> Command {
        match (identity, switch) {
            (ExecutionIdentity::Caller { .. }, _) => self.to_command(working_dir),
            (ExecutionIdentity::Service { uid, gid, .. }, IdentitySwitch::Credentials) => {
                let mut command = self.to_command(working_dir);
                command.uid(*uid).gid(*gid);
                command
            }
            (ExecutionIdentity::Service { name, .. }, IdentitySwitch::Su) => {
                let mut command = Command::new(SU_PROGRAM);
                command
                    .arg("-")
                    .arg(name)
                    .arg("-c")
                    .arg(self.shell_line())
                    .current_dir(working_dir);
                command
            }
        }
    }
}

/// Builds engine commands for one instance's identity and working directory.
#[derive(Debug, Clone, Copy)]
pub struct Invoker<'a> {
    identity: &'a ExecutionIdentity,
    switch: IdentitySwitch,
    working_dir: &'a Path,
}

impl<'a> Invoker<'a> {
    /// Creates an invoker.
    #[must_use]
    pub const fn new(
        identity: &'a ExecutionIdentity,
        switch: IdentitySwitch,
        working_dir: &'a Path,
    ) -> Self {
        Self {
            identity,
            switch,
            working_dir,
        }
    }

    /// Builds `spec` as the instance's execution identity.
    #[must_use]
    pub fn command(&self, spec: &CommandSpec) -> Command {
        spec.build(self.identity, self.switch, self.working_dir)
    }

    /// Builds `spec` as the caller, for client tools that authenticate as
    /// the calling process.
    #[must_use]
    pub fn caller_command(&self, spec: &CommandSpec) -> Command {
        spec.to_command(self.working_dir)
    }

    /// Directory commands start in.
    #[must_use]
    pub const fn working_dir(&self) -> &Path {
        self.working_dir
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn spec() -> CommandSpec {
        CommandSpec::new("/usr/lib/postgresql/16/bin/postgres")
            .arg("-D")
            .arg("/tmp/pg test/data")
            .args(["-h", ""])
    }

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    fn caller_commands_run_the_program_directly(spec: CommandSpec) {
        let identity = ExecutionIdentity::Caller {
            name: String::from("alice"),
        };

        let command = spec.build(&identity, IdentitySwitch::Su, Path::new("/tmp"));

        assert_eq!(command.get_program(), spec.program().as_os_str());
        assert_eq!(args_of(&command), ["-D", "/tmp/pg test/data", "-h", ""]);
        assert_eq!(command.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[rstest]
    fn credential_switching_keeps_the_command_line(spec: CommandSpec) {
        let identity = ExecutionIdentity::Service {
            name: String::from("postgres"),
            uid: 70,
            gid: 70,
        };

        let command = spec.build(&identity, IdentitySwitch::Credentials, Path::new("/tmp"));

        assert_eq!(command.get_program(), spec.program().as_os_str());
        assert_eq!(args_of(&command).len(), 4);
    }

    #[rstest]
    fn su_switching_wraps_a_quoted_command_line(spec: CommandSpec) {
        let identity = ExecutionIdentity::Service {
            name: String::from("postgres"),
            uid: 70,
            gid: 70,
        };

        let command = spec.build(&identity, IdentitySwitch::Su, Path::new("/tmp"));

        assert_eq!(command.get_program(), "su");
        assert_eq!(
            args_of(&command),
            [
                "-",
                "postgres",
                "-c",
                "/usr/lib/postgresql/16/bin/postgres -D '/tmp/pg test/data' -h ''",
            ]
        );
    }

    #[test]
    fn su_lines_keep_non_utf8_paths_intact() {
        use std::os::unix::ffi::OsStrExt;

        let identity = ExecutionIdentity::Service {
            name: String::from("postgres"),
            uid: 70,
            gid: 70,
        };
        let spec = CommandSpec::new("/usr/bin/initdb")
            .arg("-D")
            .arg(OsStr::from_bytes(b"/tmp/caf\xe9/data"));

        let command = spec.build(&identity, IdentitySwitch::Su, Path::new("/tmp"));

        let line = command.get_args().last().expect("su receives a command line");
        assert_eq!(line.as_bytes(), b"/usr/bin/initdb -D '/tmp/caf\xe9/data'");
    }

    #[test]
    fn display_names_strip_directories() {
        let spec = CommandSpec::in_dir(Path::new("/usr/bin"), "mysqladmin");

        assert_eq!(spec.program(), Path::new("/usr/bin/mysqladmin"));
        assert_eq!(spec.display_name(), "mysqladmin");
    }

    #[rstest]
    #[case("credentials", IdentitySwitch::Credentials)]
    #[case("SU", IdentitySwitch::Su)]
    fn identity_switches_parse_case_insensitively(
        #[case] raw: &str,
        #[case] expected: IdentitySwitch,
    ) {
        assert_eq!(raw.parse::<IdentitySwitch>(), Ok(expected));
    }

    #[test]
    fn invoker_uses_its_identity_and_directory() {
        let identity = ExecutionIdentity::Service {
            name: String::from("mysql"),
            uid: 27,
            gid: 27,
        };
        let invoker = Invoker::new(&identity, IdentitySwitch::Su, Path::new("/var/tmp"));
        let spec = CommandSpec::new("/usr/bin/mysqladmin").arg("shutdown");

        let switched = invoker.command(&spec);
        let direct = invoker.caller_command(&spec);

        assert_eq!(switched.get_program(), "su");
        assert_eq!(direct.get_program(), "/usr/bin/mysqladmin");
        assert_eq!(direct.get_current_dir(), Some(invoker.working_dir()));
    }
}
