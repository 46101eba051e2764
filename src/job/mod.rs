//! Backup jobs and their dispatch.
//!
//! A configured job resolves into one [`BackupJob`] variant per transport.
//! The driver only relies on the [`ExecutableJob`] capability set, so adding
//! a transport means adding a variant and its module.

mod mirror;
mod snapshot;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::ca::{CaError, CertificateIssuer};
use crate::capture::{BackupResult, CaptureError, JobPhase, OutputCapture};
use crate::config::{BackupType, Config, Direction, JobSpec};
use crate::files;
use crate::process::{CommandRunner, CommandSpec, ProcessError};
use crate::settings::ToolPaths;

pub use mirror::MirrorSyncJob;
pub use snapshot::SnapshotJob;

/// Name of the script written into a job's working directory.
pub const SCRIPT_NAME: &str = "script.sh";
/// Permissions of generated scripts.
const SCRIPT_MODE: u32 = 0o750;

/// Future returned by [`ExecutableJob`] operations.
pub type JobFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations every backup job supports.
pub trait ExecutableJob {
    /// Runs the job once. Failures are recorded in the result rather than
    /// returned.
    fn run(&self) -> JobFuture<'_, BackupResult>;

    /// Describes the job for notifications.
    fn describe(&self) -> JobDescription;

    /// Writes a script an operator can run by hand to reproduce the job, and
    /// returns its path.
    fn write_debug_script(&self) -> JobFuture<'_, Result<Utf8PathBuf, JobError>>;
}

/// Outcome label used in notification subjects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    /// The job succeeded.
    Succeeded,
    /// The job failed.
    Failed,
}

impl JobStatus {
    /// Status matching `result`.
    #[must_use]
    pub const fn of(result: &BackupResult) -> Self {
        if result.succeeded() {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "FAILED",
        })
    }
}

/// Identity of a job as shown to humans.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobDescription {
    /// Transport.
    pub kind: BackupType,
    /// Job name.
    pub name: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Host running the job.
    pub host: String,
}

impl JobDescription {
    /// Describes `spec`, named `name`, running on `host`.
    #[must_use]
    pub fn new(name: &str, spec: &JobSpec, host: &str) -> Self {
        Self {
            kind: spec.kind,
            name: name.to_owned(),
            direction: spec.direction,
            host: host.to_owned(),
        }
    }

    /// Notification subject for a job that ran with `status`.
    #[must_use]
    pub fn subject(&self, status: JobStatus) -> String {
        format!(
            "{} backup job #{} {status} ({} by {})",
            self.kind, self.name, self.direction, self.host
        )
    }

    /// Notification subject for a job that could not be started.
    #[must_use]
    pub fn unrunnable_subject(&self) -> String {
        format!(
            "{} backup job #{} FAILED on {}",
            self.kind, self.name, self.host
        )
    }
}

/// Everything jobs borrow from the surrounding run.
pub struct JobEnvironment<'a, R, I> {
    /// Validated configuration.
    pub config: &'a Config,
    /// Runs external commands.
    pub runner: &'a R,
    /// Issues certificates for mirror jobs. `None` when no client could be
    /// built, in which case mirror jobs fail at issuance.
    pub issuer: Option<&'a I>,
    /// Locations of external tools.
    pub tools: &'a ToolPaths,
    /// Local host identifier.
    pub hostname: &'a str,
}

impl<R, I> Clone for JobEnvironment<'_, R, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, I> Copy for JobEnvironment<'_, R, I> {}

impl<R, I> fmt::Debug for JobEnvironment<'_, R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEnvironment")
            .field("tools", self.tools)
            .field("hostname", &self.hostname)
            .field("has_issuer", &self.issuer.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors raised while resolving a job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    /// No job has the requested name.
    #[error("no backup job named {0}")]
    UnknownJob(String),
    /// The shared section the job's transport needs is absent.
    #[error("job {job} needs the {section} section, which is not configured for this host")]
    MissingSection {
        /// Job name.
        job: String,
        /// Missing section.
        section: &'static str,
    },
    /// A field the transport needs is absent.
    #[error("job {job} has no {field}")]
    MissingField {
        /// Job name.
        job: String,
        /// Missing field.
        field: &'static str,
    },
}

/// Errors raised while preparing or running a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Certificate issuance failed.
    #[error(transparent)]
    Certificate(#[from] CaError),
    /// No certificate authority client is available.
    #[error("could not issue certificate: no certificate authority client available")]
    NoIssuer,
    /// Output capture could not be set up.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The transport command could not be started.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// A file in the working directory could not be written.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Affected path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// A resolved job of either transport.
#[derive(Debug)]
pub enum BackupJob<'a, R, I> {
    /// File mirroring over SSH.
    MirrorSync(MirrorSyncJob<'a, R, I>),
    /// Snapshots in object storage.
    Snapshot(SnapshotJob<'a, R>),
}

impl<R: CommandRunner, I: CertificateIssuer> ExecutableJob for BackupJob<'_, R, I> {
    fn run(&self) -> JobFuture<'_, BackupResult> {
        match self {
            Self::MirrorSync(job) => job.run(),
            Self::Snapshot(job) => job.run(),
        }
    }

    fn describe(&self) -> JobDescription {
        match self {
            Self::MirrorSync(job) => job.describe(),
            Self::Snapshot(job) => job.describe(),
        }
    }

    fn write_debug_script(&self) -> JobFuture<'_, Result<Utf8PathBuf, JobError>> {
        match self {
            Self::MirrorSync(job) => job.write_debug_script(),
            Self::Snapshot(job) => job.write_debug_script(),
        }
    }
}

/// Resolves the job called `name`, wiring in only the sections its transport
/// needs. The job keeps its files in `work_dir`.
///
/// # Errors
///
/// Returns [`DispatchError`] when the job does not exist or the
/// configuration lacks what its transport needs.
pub fn build_job<'a, R, I>(
    name: &str,
    env: &JobEnvironment<'a, R, I>,
    work_dir: &Utf8Path,
) -> Result<BackupJob<'a, R, I>, DispatchError> {
    let (job_name, spec) = env
        .config
        .job(name)
        .ok_or_else(|| DispatchError::UnknownJob(name.to_owned()))?;
    match spec.kind {
        BackupType::MirrorSync => {
            MirrorSyncJob::new(job_name, spec, env, work_dir).map(BackupJob::MirrorSync)
        }
        BackupType::Snapshot => {
            SnapshotJob::new(job_name, spec, env, work_dir).map(BackupJob::Snapshot)
        }
    }
}

/// Runs `command` with its output streamed into compressed captures in the
/// result's working directory. Returns the command's exit code.
fn run_captured<R: CommandRunner>(
    runner: &R,
    command: &CommandSpec,
    compressor: &str,
    result: &mut BackupResult,
) -> Result<Option<i32>, JobError> {
    let mut capture = OutputCapture::start(&result.work_dir, compressor)?;
    result.advance(JobPhase::Running);
    let outcome = capture
        .child_stdio()
        .map_err(JobError::from)
        .and_then(|stdio| runner.run_streaming(command, stdio).map_err(JobError::from));
    result.captures = Some(capture.finish(&mut result.log));
    outcome
}

fn write_file(path: &Utf8Path, contents: &str, mode: u32) -> Result<(), JobError> {
    files::write_with_mode(path, contents.as_bytes(), mode).map_err(|err| JobError::Io {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

fn write_script(work_dir: &Utf8Path, contents: &str) -> Result<Utf8PathBuf, JobError> {
    let path = work_dir.join(SCRIPT_NAME);
    write_file(&path, contents, SCRIPT_MODE)?;
    Ok(path)
}

#[cfg(test)]
mod tests;
