//! The `run` driver: every local job, one at a time, in document order.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ca::CertificateIssuer;
use crate::config::JobSpec;
use crate::job::{
    DispatchError, ExecutableJob, JobDescription, JobEnvironment, JobError, JobStatus, build_job,
};
use crate::mount::MountOracle;
use crate::notify::{Mailer, NotificationOutcome, Notifier, StatusReport};
use crate::process::CommandRunner;

/// Prefix of every job working directory.
pub const WORK_DIR_PREFIX: &str = "keel-";

/// How many local jobs ran and how many of them succeeded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DumpSummary {
    /// Jobs that succeeded.
    pub succeeded: usize,
    /// Jobs attempted.
    pub total: usize,
}

impl DumpSummary {
    /// Returns `true` when no job failed.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

impl fmt::Display for DumpSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} backup jobs ran successfully",
            self.succeeded, self.total
        )
    }
}

/// Errors raised while preparing a debug script.
#[derive(Debug, Error)]
pub enum DumpError {
    /// The job does not exist or runs on another host.
    #[error("job {job} not found on {host}")]
    NotLocal {
        /// Requested job.
        job: String,
        /// Local host identifier.
        host: String,
    },
    /// The working directory could not be created.
    #[error("failed to create a working directory: {0}")]
    WorkDir(String),
    /// The job could not be resolved.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The script could not be written.
    #[error(transparent)]
    Job(#[from] JobError),
}

fn work_dir() -> Result<(TempDir, Utf8PathBuf), String> {
    let dir = tempfile::Builder::new()
        .prefix(WORK_DIR_PREFIX)
        .tempdir()
        .map_err(|err| err.to_string())?;
    let path = Utf8Path::from_path(dir.path())
        .map(Utf8Path::to_owned)
        .ok_or_else(|| format!("{} is not valid UTF-8", dir.path().display()))?;
    Ok((dir, path))
}

/// Runs every job configured for the local host and reports on each.
pub struct Dump<'a, R, I, O, M> {
    jobs: JobEnvironment<'a, R, I>,
    mounts: &'a O,
    notifier: &'a Notifier<M>,
}

impl<'a, R, I, O, M> Dump<'a, R, I, O, M>
where
    R: CommandRunner,
    I: CertificateIssuer,
    O: MountOracle,
    M: Mailer,
{
    /// Prepares a run over `jobs.config` for `jobs.hostname`.
    #[must_use]
    pub const fn new(
        jobs: JobEnvironment<'a, R, I>,
        mounts: &'a O,
        notifier: &'a Notifier<M>,
    ) -> Self {
        Self {
            jobs,
            mounts,
            notifier,
        }
    }

    /// Runs all local jobs and logs the summary.
    pub async fn run(&self) -> DumpSummary {
        let mut summary = DumpSummary::default();
        for (name, spec) in self.jobs.config.local_jobs(self.jobs.hostname) {
            summary.total += 1;
            if self.run_job(name, spec).await {
                summary.succeeded += 1;
            }
        }
        if summary.total == 0 {
            info!("No backups configured");
        } else {
            info!(
                succeeded = summary.succeeded,
                total = summary.total,
                "{summary}"
            );
        }
        summary
    }

    async fn run_job(&self, name: &str, spec: &JobSpec) -> bool {
        let planned = JobDescription::new(name, spec, self.jobs.hostname);
        if !self.is_mounted(name, &spec.local_path) {
            let message = format!("The filesystem associated with job \"{name}\" is not mounted");
            error!(job = %name, path = %spec.local_path, "{message}");
            self.report_unrunnable(&planned, message);
            return false;
        }

        let (dir, path) = match work_dir() {
            Ok(created) => created,
            Err(err) => {
                let message = format!("failed to create a working directory: {err}");
                error!(job = %name, "{message}");
                self.report_unrunnable(&planned, message);
                return false;
            }
        };

        let (result, description) = match build_job(name, &self.jobs, &path) {
            Ok(job) => {
                info!(job = %name, kind = %spec.kind, "starting backup job");
                (job.run().await, job.describe())
            }
            Err(err) => {
                error!(job = %name, error = %err, "could not prepare backup job");
                self.report_unrunnable(&planned, err.to_string());
                close_work_dir(dir);
                return false;
            }
        };

        let status = JobStatus::of(&result);
        info!(job = %name, status = %status, phase = %result.phase, "backup job finished");
        self.send(&StatusReport {
            subject: description.subject(status),
            exec_log: result.log.lines().to_vec(),
            captures: result.captures,
        });
        close_work_dir(dir);
        status == JobStatus::Succeeded
    }

    fn is_mounted(&self, name: &str, path: &Utf8Path) -> bool {
        self.mounts.is_mounted(path).unwrap_or_else(|err| {
            warn!(job = %name, path = %path, error = %err, "could not check mount state");
            false
        })
    }

    fn report_unrunnable(&self, description: &JobDescription, message: String) {
        self.send(&StatusReport {
            subject: description.unrunnable_subject(),
            exec_log: vec![message],
            captures: None,
        });
    }

    fn send(&self, report: &StatusReport) {
        if self.notifier.notify(report) == NotificationOutcome::Delivered {
            debug!(subject = %report.subject, "status email sent");
        }
    }
}

impl<R, I, O, M> fmt::Debug for Dump<'_, R, I, O, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dump")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

fn close_work_dir(dir: TempDir) {
    let path = dir.path().display().to_string();
    if let Err(err) = dir.close() {
        warn!(path = %path, error = %err, "could not remove working directory");
    }
}

/// Writes the debug script of `job_name` into a new directory that is left
/// in place, and returns that directory.
///
/// # Errors
///
/// Returns [`DumpError`] when the job is not local, the directory cannot be
/// created or the script cannot be written.
pub async fn setup_debug_script<R, I>(
    env: &JobEnvironment<'_, R, I>,
    job_name: &str,
) -> Result<Utf8PathBuf, DumpError>
where
    R: CommandRunner,
    I: CertificateIssuer,
{
    let is_local = env
        .config
        .job(job_name)
        .is_some_and(|(_, spec)| spec.local_host == env.hostname);
    if !is_local {
        return Err(DumpError::NotLocal {
            job: job_name.to_owned(),
            host: env.hostname.to_owned(),
        });
    }
    let (dir, path) = work_dir().map_err(DumpError::WorkDir)?;
    let job = build_job(job_name, env, &path)?;
    let script = job.write_debug_script().await?;
    drop(dir.keep());
    info!(job = %job_name, script = %script, "debug script written");
    Ok(path)
}
