//! Streaming capture of job output into gzip-compressed files plus the
//! per-invocation [`BackupResult`].
//!
//! Each stream gets its own compressor process. The job's child writes
//! straight into the compressor's stdin, so output never passes through this
//! process's memory and arbitrarily large transfers stay bounded.

use std::fmt;
use std::fs::File;
use std::process::{Child, ChildStdin, Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::process::{ChildStdio, status_text};

/// File name of the compressed stdout capture inside a job's working
/// directory.
pub const STDOUT_CAPTURE: &str = "stdout.gz";
/// File name of the compressed stderr capture.
pub const STDERR_CAPTURE: &str = "stderr.gz";

/// Where a job invocation currently stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobPhase {
    /// Nothing has happened yet.
    Init,
    /// A mirror job holds a freshly issued certificate.
    CredentialIssued,
    /// A snapshot job wrote its script.
    ScriptWritten,
    /// The transport command is executing.
    Running,
    /// The transport command exited with status zero.
    Succeeded,
    /// The job failed at some phase.
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::CredentialIssued => "credential-issued",
            Self::ScriptWritten => "script-written",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Ordered, human-readable lines describing one job invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionLog {
    lines: Vec<String>,
}

impl ExecutionLog {
    /// Records an informational line.
    pub fn info(&mut self, message: impl fmt::Display) {
        self.lines.push(format!("INFO: {message}"));
    }

    /// Records a warning line.
    pub fn warning(&mut self, message: impl fmt::Display) {
        self.lines.push(format!("WARNING: {message}"));
    }

    /// Records an error line.
    pub fn error(&mut self, message: impl fmt::Display) {
        self.lines.push(format!("ERROR: {message}"));
    }

    /// Returns the recorded lines in order.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl From<Vec<String>> for ExecutionLog {
    fn from(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

/// Locations of the two compressed capture files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapturedOutput {
    /// Compressed stdout of the job's command.
    pub stdout: Utf8PathBuf,
    /// Compressed stderr of the job's command.
    pub stderr: Utf8PathBuf,
}

/// Outcome of one job invocation, handed to the driver for notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupResult {
    /// Working directory owned by the invocation.
    pub work_dir: Utf8PathBuf,
    /// Capture files, present once capture started.
    pub captures: Option<CapturedOutput>,
    /// Exit code of the transport command, if it ran to completion.
    pub exit_code: Option<i32>,
    /// Last phase reached.
    pub phase: JobPhase,
    /// Execution log.
    pub log: ExecutionLog,
}

impl BackupResult {
    /// Starts a result in [`JobPhase::Init`].
    #[must_use]
    pub fn new(work_dir: Utf8PathBuf) -> Self {
        Self {
            work_dir,
            captures: None,
            exit_code: None,
            phase: JobPhase::Init,
            log: ExecutionLog::default(),
        }
    }

    /// Moves to `phase`.
    pub fn advance(&mut self, phase: JobPhase) {
        debug!(from = %self.phase, to = %phase, "job phase transition");
        self.phase = phase;
    }

    /// Records a zero exit and moves to [`JobPhase::Succeeded`].
    pub fn succeed(&mut self) {
        self.exit_code = Some(0);
        self.advance(JobPhase::Succeeded);
    }

    /// Records `message` as an error and moves to [`JobPhase::Failed`].
    pub fn fail(&mut self, exit_code: Option<i32>, message: impl fmt::Display) {
        self.log.error(message);
        self.exit_code = exit_code;
        self.advance(JobPhase::Failed);
    }

    /// Returns `true` when the job reached [`JobPhase::Succeeded`].
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.phase, JobPhase::Succeeded) && matches!(self.exit_code, Some(0))
    }
}

/// Errors raised while setting up output capture.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CaptureError {
    /// A capture file could not be created.
    #[error("failed to create {path}: {message}")]
    Create {
        /// Capture file path.
        path: Utf8PathBuf,
        /// Human-readable reason.
        message: String,
    },
    /// The compressor could not be started.
    #[error("failed to spawn compressor {program}: {message}")]
    Spawn {
        /// Compressor program.
        program: String,
        /// Human-readable reason.
        message: String,
    },
    /// [`OutputCapture::child_stdio`] was called twice.
    #[error("compressor pipes were already handed out")]
    PipesTaken,
}

#[derive(Debug)]
struct Pipeline {
    stream: &'static str,
    path: Utf8PathBuf,
    compressor: Child,
}

impl Pipeline {
    fn spawn(
        stream: &'static str,
        path: Utf8PathBuf,
        program: &str,
    ) -> Result<Self, CaptureError> {
        let file = File::create(&path).map_err(|err| CaptureError::Create {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let compressor = Command::new(program)
            .args(["--best", "-c"])
            .stdin(Stdio::piped())
            .stdout(file)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| CaptureError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Self {
            stream,
            path,
            compressor,
        })
    }

    fn take_input(&mut self) -> Option<ChildStdin> {
        self.compressor.stdin.take()
    }

    fn close(mut self, log: &mut ExecutionLog) -> Utf8PathBuf {
        drop(self.compressor.stdin.take());
        match self.compressor.wait() {
            Ok(status) if status.success() => {
                debug!(stream = self.stream, path = %self.path, "capture finalized");
            }
            Ok(status) => {
                let code = status_text(status.code());
                warn!(stream = self.stream, code = %code, "compressor exited abnormally");
                log.warning(format!(
                    "compressor for {} exited abnormally (status={code})",
                    self.stream
                ));
            }
            Err(err) => {
                warn!(stream = self.stream, error = %err, "could not wait for compressor");
                log.warning(format!(
                    "could not wait for the {} compressor: {err}",
                    self.stream
                ));
            }
        }
        self.path
    }
}

/// Two running compressors, one per standard stream.
#[derive(Debug)]
pub struct OutputCapture {
    stdout: Pipeline,
    stderr: Pipeline,
}

impl OutputCapture {
    /// Spawns `compressor --best -c` for stdout and stderr, writing to
    /// [`STDOUT_CAPTURE`] and [`STDERR_CAPTURE`] inside `work_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError`] when a capture file cannot be created or a
    /// compressor cannot be started.
    pub fn start(work_dir: &Utf8Path, compressor: &str) -> Result<Self, CaptureError> {
        let stdout = Pipeline::spawn("stdout", work_dir.join(STDOUT_CAPTURE), compressor)?;
        let stderr = match Pipeline::spawn("stderr", work_dir.join(STDERR_CAPTURE), compressor) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                stdout.close(&mut ExecutionLog::default());
                return Err(err);
            }
        };
        Ok(Self { stdout, stderr })
    }

    /// Hands the compressors' input pipes over for use as a child's stdout
    /// and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::PipesTaken`] when called more than once.
    pub fn child_stdio(&mut self) -> Result<ChildStdio, CaptureError> {
        let (Some(stdout), Some(stderr)) = (self.stdout.take_input(), self.stderr.take_input())
        else {
            return Err(CaptureError::PipesTaken);
        };
        Ok(ChildStdio {
            stdout: Stdio::from(stdout),
            stderr: Stdio::from(stderr),
        })
    }

    /// Closes any pipe ends still held here and waits for the stdout
    /// compressor, then the stderr one. Abnormal compressor exits are logged
    /// without affecting the job outcome.
    pub fn finish(self, log: &mut ExecutionLog) -> CapturedOutput {
        let stdout = self.stdout.close(log);
        let stderr = self.stderr.close(log);
        CapturedOutput { stdout, stderr }
    }
}
