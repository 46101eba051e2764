//! Snapshot jobs: `restic` backups to B2 driven by a generated shell script.
//!
//! The script initializes the repository on first use, backs up, prunes by
//! retention and checks the repository. Storage credentials reach `restic`
//! through the script's environment only.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info};

use crate::capture::{BackupResult, JobPhase};
use crate::config::{JobSpec, SnapshotStoreConfig};
use crate::process::{CommandRunner, CommandSpec, render_command, status_text};
use crate::settings::ToolPaths;

use super::{
    DispatchError, ExecutableJob, JobDescription, JobEnvironment, JobError, JobFuture,
    run_captured, write_file, write_script,
};

/// Tag attached to every snapshot this tool creates.
pub const SNAPSHOT_TAG: &str = "systemd_unit=keel-dump.service";
/// Name of the credentials file written next to a debug script.
pub const CREDENTIALS_FILE: &str = "credentials.env";
const CREDENTIALS_MODE: u32 = 0o600;

/// A snapshot job ready to run.
#[derive(Debug)]
pub struct SnapshotJob<'a, R> {
    name: &'a str,
    spec: &'a JobSpec,
    store: &'a SnapshotStoreConfig,
    password_path: &'a Utf8Path,
    retention: &'a str,
    runner: &'a R,
    tools: &'a ToolPaths,
    hostname: &'a str,
    work_dir: Utf8PathBuf,
}

fn quote(value: &str) -> String {
    render_command([value])
}

impl<'a, R> SnapshotJob<'a, R> {
    pub(super) fn new<I>(
        name: &'a str,
        spec: &'a JobSpec,
        env: &JobEnvironment<'a, R, I>,
        work_dir: &Utf8Path,
    ) -> Result<Self, DispatchError> {
        let store = env
            .config
            .snapshot_store()
            .ok_or_else(|| DispatchError::MissingSection {
                job: name.to_owned(),
                section: "restic",
            })?;
        let password_path = spec
            .password_path
            .as_deref()
            .ok_or_else(|| DispatchError::MissingField {
                job: name.to_owned(),
                field: "passwordPath",
            })?;
        let retention = spec
            .retention
            .as_deref()
            .ok_or_else(|| DispatchError::MissingField {
                job: name.to_owned(),
                field: "retention",
            })?;
        Ok(Self {
            name,
            spec,
            store,
            password_path,
            retention,
            runner: env.runner,
            tools: env.tools,
            hostname: env.hostname,
            work_dir: work_dir.to_owned(),
        })
    }

    /// Renders the script that initializes, backs up, prunes and checks the
    /// job's repository.
    #[must_use]
    pub fn script(&self) -> String {
        let mut backup = vec!["restic", "--quiet", "backup", "--tag", SNAPSHOT_TAG];
        if self.spec.one_file_system {
            backup.push("--one-file-system");
        }
        backup.push(self.spec.local_path.as_str());
        let forget = [
            "restic",
            "--quiet",
            "forget",
            "--tag",
            SNAPSHOT_TAG,
            "--prune",
            "--keep-within",
            self.retention,
        ];

        format!(
            concat!(
                "#!/bin/sh\n",
                "set -eux\n",
                "restic() {{\n",
                "    command {restic} \\\n",
                "        --repo {repo} \\\n",
                "        --password-file {password} \\\n",
                "        --cache-dir {cache} \\\n",
                "        \"$@\"\n",
                "}}\n",
                "restic snapshots >/dev/null 2>&1 || restic --quiet init\n",
                "{backup}\n",
                "{forget}\n",
                "restic --quiet check\n",
            ),
            restic = quote(&self.tools.restic),
            repo = quote(&self.store.repository(self.name)),
            password = quote(self.password_path.as_str()),
            cache = quote(self.store.cache_dir.as_str()),
            backup = render_command(backup),
            forget = render_command(forget),
        )
    }

    fn credentials_file(&self) -> String {
        self.store
            .credential_env()
            .iter()
            .map(|(key, value)| format!("{key}={}\n", quote(value)))
            .collect()
    }
}

impl<R: CommandRunner> SnapshotJob<'_, R> {
    fn execute(&self) -> BackupResult {
        let mut result = BackupResult::new(self.work_dir.clone());
        let script = match write_script(&self.work_dir, &self.script()) {
            Ok(script) => script,
            Err(err) => {
                error!(job = %self.name, error = %err, "could not write restic script");
                result.fail(None, err);
                return result;
            }
        };
        result.advance(JobPhase::ScriptWritten);
        result
            .log
            .info(format!("Executing {script}, see details in attached files."));
        info!(job = %self.name, script = %script, "running restic script");

        let command = self
            .store
            .credential_env()
            .into_iter()
            .fold(CommandSpec::new(script.as_str()), |spec, (key, value)| {
                spec.env(key, value)
            });
        match run_captured(self.runner, &command, &self.tools.gzip, &mut result) {
            Ok(Some(0)) => result.succeed(),
            Ok(code) => {
                error!(job = %self.name, status = %status_text(code), "restic script failed");
                result.fail(
                    code,
                    format!(
                        "\"{script}\" failed with exit status {}",
                        status_text(code)
                    ),
                );
            }
            Err(err) => {
                error!(job = %self.name, error = %err, "restic script could not run");
                result.fail(None, err);
            }
        }
        result
    }

    fn debug_script(&self) -> Result<Utf8PathBuf, JobError> {
        let script = write_script(&self.work_dir, &self.script())?;
        write_file(
            &self.work_dir.join(CREDENTIALS_FILE),
            &self.credentials_file(),
            CREDENTIALS_MODE,
        )?;
        Ok(script)
    }
}

impl<R: CommandRunner> ExecutableJob for SnapshotJob<'_, R> {
    fn run(&self) -> JobFuture<'_, BackupResult> {
        Box::pin(async move { self.execute() })
    }

    fn describe(&self) -> JobDescription {
        JobDescription::new(self.name, self.spec, self.hostname)
    }

    fn write_debug_script(&self) -> JobFuture<'_, Result<Utf8PathBuf, JobError>> {
        Box::pin(async move { self.debug_script() })
    }
}
