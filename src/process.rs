//! Subprocess execution seam shared by backup jobs, the mount oracle and
//! restores.

use std::ffi::OsString;
use std::fmt;
use std::process::{Command, Stdio};

use shell_escape::unix::escape;
use thiserror::Error;

/// Result of running an external command with captured output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Converts a non-zero exit into [`ProcessError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::CommandFailure`] when the command did not exit
    /// with status zero.
    pub fn into_success(self, program: &str) -> Result<Self, ProcessError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ProcessError::CommandFailure {
            program: program.to_owned(),
            status_text: status_text(self.code),
            stderr: self.stderr,
        })
    }
}

/// Renders an optional exit code the way failure messages print it.
#[must_use]
pub fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

/// Fully resolved command line plus environment overrides for one child.
///
/// Environment values are deliberately left out of [`fmt::Debug`] and
/// [`CommandSpec::command_line`] because they carry credentials.
#[derive(Clone, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Environment variables added to the inherited environment.
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    /// Starts a command for `program` without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Returns the program followed by its arguments as strings.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        argv
    }

    /// Renders the program and arguments as a shell-quoted command line.
    #[must_use]
    pub fn command_line(&self) -> String {
        render_command(self.argv())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.envs.iter().map(|(key, _)| key.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .finish()
    }
}

/// Joins `argv` into a single command line, quoting each argument for a
/// POSIX shell.
#[must_use]
pub fn render_command<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result = String::new();
    let mut first = true;

    for arg in argv {
        if first {
            first = false;
        } else {
            result.push(' ');
        }

        let escaped = escape(arg.as_ref().into());
        result.push_str(escaped.as_ref());
    }

    result
}

/// Destinations for a streamed child's standard output and error.
#[derive(Debug)]
pub struct ChildStdio {
    /// Where the child's stdout goes.
    pub stdout: Stdio,
    /// Where the child's stderr goes.
    pub stderr: Stdio,
}

impl ChildStdio {
    /// Inherits both streams from the current process.
    #[must_use]
    pub fn inherit() -> Self {
        Self {
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError>;

    /// Runs `command` to completion with its output routed to `stdio`,
    /// returning the exit code (absent when killed by a signal).
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run_streaming(
        &self,
        command: &CommandSpec,
        stdio: ChildStdio,
    ) -> Result<Option<i32>, ProcessError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ProcessError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_streaming(
        &self,
        command: &CommandSpec,
        stdio: ChildStdio,
    ) -> Result<Option<i32>, ProcessError> {
        let status = Command::new(&command.program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(stdio.stdout)
            .stderr(stdio.stderr)
            .status()
            .map_err(|err| ProcessError::Spawn {
                program: command.program.clone(),
                message: err.to_string(),
            })?;
        Ok(status.code())
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Spawning the process failed.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Human-readable reason.
        message: String,
    },
    /// The command ran but returned a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit code text ("unknown" when the process was killed).
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
}
