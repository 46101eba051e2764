//! Restores the latest snapshot of a snapshot job.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::{BackupType, Config};
use crate::mount::MountOracle;
use crate::process::{ChildStdio, CommandRunner, CommandSpec, ProcessError, status_text};

/// Errors raised by [`Restore`].
#[derive(Debug, Error)]
pub enum RestoreError {
    /// No job has the requested name.
    #[error("Could not find any backups named {0}")]
    UnknownJob(String),
    /// The job is not a snapshot job.
    #[error("Only restic-b2 backups can be restored, {job} is a {kind} job")]
    NotSnapshot {
        /// Requested job.
        job: String,
        /// Its transport.
        kind: BackupType,
    },
    /// The snapshot store or the job's password file is not configured here.
    #[error("job {0} cannot be restored on this host: restic settings are missing")]
    MissingSection(String),
    /// The destination's filesystem is not mounted.
    #[error("The filesystem for {0} must be mounted before restore")]
    NotMounted(Utf8PathBuf),
    /// `restic` could not be started.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// `restic` exited unsuccessfully.
    #[error("restic restore exited with status {status}")]
    Failed {
        /// Rendered exit status.
        status: String,
    },
}

/// Restores snapshots with `restic`, streaming its output to the terminal.
#[derive(Debug)]
pub struct Restore<'a, R, O> {
    config: &'a Config,
    runner: &'a R,
    mounts: &'a O,
    restic_bin: &'a str,
}

impl<'a, R: CommandRunner, O: MountOracle> Restore<'a, R, O> {
    /// Prepares restores from the repositories of `config`.
    #[must_use]
    pub const fn new(
        config: &'a Config,
        runner: &'a R,
        mounts: &'a O,
        restic_bin: &'a str,
    ) -> Self {
        Self {
            config,
            runner,
            mounts,
            restic_bin,
        }
    }

    /// Builds the restore command for `job_name` and the directory it
    /// restores into: `dest_path`, or the job's local path.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError`] when the job is unknown, not a snapshot job,
    /// or the snapshot store is not configured.
    pub fn command(
        &self,
        job_name: &str,
        dest_path: Option<&Utf8Path>,
    ) -> Result<(CommandSpec, Utf8PathBuf), RestoreError> {
        let (name, spec) = self
            .config
            .job(job_name)
            .ok_or_else(|| RestoreError::UnknownJob(job_name.to_owned()))?;
        if spec.kind != BackupType::Snapshot {
            return Err(RestoreError::NotSnapshot {
                job: name.to_owned(),
                kind: spec.kind,
            });
        }
        let (Some(store), Some(password_path)) =
            (self.config.snapshot_store(), spec.password_path.as_ref())
        else {
            return Err(RestoreError::MissingSection(name.to_owned()));
        };

        let destination = dest_path.unwrap_or(&spec.local_path).to_owned();
        let repository = store.repository(name);
        let command = store.credential_env().into_iter().fold(
            CommandSpec::new(self.restic_bin).args([
                "--repo",
                repository.as_str(),
                "--password-file",
                password_path.as_str(),
                "--cache-dir",
                store.cache_dir.as_str(),
                "restore",
                "--target",
                destination.as_str(),
                "latest",
            ]),
            |command, (key, value)| command.env(key, value),
        );
        Ok((command, destination))
    }

    /// Restores the latest snapshot of `job_name` and returns the directory
    /// it was restored into.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError::NotMounted`] when the destination's filesystem
    /// is not mounted, [`RestoreError::Failed`] when `restic` fails, and the
    /// errors of [`Restore::command`].
    pub fn run(
        &self,
        job_name: &str,
        dest_path: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf, RestoreError> {
        let (command, destination) = self.command(job_name, dest_path)?;
        if !self.mounts.is_mounted(&destination).unwrap_or(false) {
            return Err(RestoreError::NotMounted(destination));
        }

        info!(job = %job_name, destination = %destination, "Restoring latest restic snapshot");
        let code = self.runner.run_streaming(&command, ChildStdio::inherit())?;
        if code == Some(0) {
            Ok(destination)
        } else {
            Err(RestoreError::Failed {
                status: status_text(code),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{B2_ACCOUNT_ID_ENV, B2_ACCOUNT_KEY_ENV};
    use crate::test_support::{HostFixture, ScriptedRunner, StaticMountOracle};

    const HOST: &str = "keel.example.net";

    fn config(files: &HostFixture) -> Config {
        files
            .config(json!({
                "data": files.snapshot_job("/srv/data"),
                "mirror": files.mirror_job("push", "/srv/www", "host", "/www"),
            }))
            .expect("valid config")
    }

    #[test]
    fn restores_latest_into_the_local_path() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        runner.push_success();
        let mounts = StaticMountOracle::all_mounted();

        let destination = Restore::new(&config, &runner, &mounts, "restic")
            .run("data", None)
            .expect("restore succeeds");

        assert_eq!(destination, "/srv/data");
        let invocations = runner.invocations();
        let invocation = invocations.first().expect("restic invoked");
        assert_eq!(
            invocation.command_string(),
            format!(
                "restic --repo b2:fleet-backups:data --password-file {} --cache-dir {} restore --target /srv/data latest",
                files.path("restic-password"),
                files.path("cache"),
            )
        );
        assert_eq!(
            invocation.envs,
            [
                (String::from(B2_ACCOUNT_ID_ENV), String::from("key-id")),
                (String::from(B2_ACCOUNT_KEY_ENV), String::from("app-key")),
            ]
        );
    }

    #[test]
    fn destination_can_be_overridden() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        let mounts = StaticMountOracle::all_mounted();

        let (command, destination) = Restore::new(&config, &runner, &mounts, "restic")
            .command("data", Some(Utf8Path::new("/mnt/scratch")))
            .expect("command builds");

        assert_eq!(destination, "/mnt/scratch");
        assert!(command.command_line().contains("--target /mnt/scratch latest"));
    }

    #[test]
    fn mirror_jobs_cannot_be_restored() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        let mounts = StaticMountOracle::all_mounted();

        let err = Restore::new(&config, &runner, &mounts, "restic")
            .run("mirror", None)
            .expect_err("not a snapshot job");

        assert!(matches!(err, RestoreError::NotSnapshot { .. }), "{err:?}");
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn unmounted_destination_is_refused() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        let mounts = StaticMountOracle::mounted(["/mnt"]);

        let err = Restore::new(&config, &runner, &mounts, "restic")
            .run("data", None)
            .expect_err("unmounted");

        assert_eq!(
            err.to_string(),
            "The filesystem for /srv/data must be mounted before restore"
        );
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn failing_restic_is_reported() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        runner.push_exit_code(3);
        let mounts = StaticMountOracle::all_mounted();

        let err = Restore::new(&config, &runner, &mounts, "restic")
            .run("data", None)
            .expect_err("restic fails");

        assert_eq!(err.to_string(), "restic restore exited with status 3");
    }

    #[test]
    fn unknown_job_is_reported() {
        let files = HostFixture::new(HOST).expect("host fixture");
        let config = config(&files);
        let runner = ScriptedRunner::new();
        let mounts = StaticMountOracle::all_mounted();

        let err = Restore::new(&config, &runner, &mounts, "restic")
            .run("nope", None)
            .expect_err("unknown job");

        assert_eq!(err.to_string(), "Could not find any backups named nope");
    }
}
