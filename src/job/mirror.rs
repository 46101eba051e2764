//! Mirror jobs: `rsync` over `ssh`, authenticated with a certificate that is
//! bound to the one server command the job needs.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info};

use crate::ca::{CertificateIssuer, CertificateRequest, IssuedCertificate};
use crate::capture::{BackupResult, JobPhase};
use crate::config::{Direction, JobSpec, TransportIdentity};
use crate::process::{CommandRunner, status_text};
use crate::rsync::MirrorCommands;
use crate::settings::ToolPaths;

use super::{
    DispatchError, ExecutableJob, JobDescription, JobEnvironment, JobError, JobFuture,
    run_captured, write_script,
};

/// Name of the certificate copy kept next to a debug script.
pub const CERTIFICATE_COPY: &str = "ssh-cert.pub";

/// A mirror job ready to run.
#[derive(Debug)]
pub struct MirrorSyncJob<'a, R, I> {
    name: &'a str,
    spec: &'a JobSpec,
    remote_host: &'a str,
    remote_path: &'a Utf8Path,
    identity: &'a TransportIdentity,
    runner: &'a R,
    issuer: Option<&'a I>,
    tools: &'a ToolPaths,
    hostname: &'a str,
    work_dir: Utf8PathBuf,
}

impl<'a, R, I> MirrorSyncJob<'a, R, I> {
    pub(super) fn new(
        name: &'a str,
        spec: &'a JobSpec,
        env: &JobEnvironment<'a, R, I>,
        work_dir: &Utf8Path,
    ) -> Result<Self, DispatchError> {
        let transport = env
            .config
            .transport()
            .ok_or_else(|| DispatchError::MissingSection {
                job: name.to_owned(),
                section: "ssh",
            })?;
        let remote_host = spec
            .remote_host
            .as_deref()
            .ok_or_else(|| DispatchError::MissingField {
                job: name.to_owned(),
                field: "remoteHost",
            })?;
        let remote_path = spec
            .remote_path
            .as_deref()
            .ok_or_else(|| DispatchError::MissingField {
                job: name.to_owned(),
                field: "remotePath",
            })?;
        Ok(Self {
            name,
            spec,
            remote_host,
            remote_path,
            identity: &transport.identity,
            runner: env.runner,
            issuer: env.issuer,
            tools: env.tools,
            hostname: env.hostname,
            work_dir: work_dir.to_owned(),
        })
    }

    fn commands(&self) -> MirrorCommands<'a> {
        MirrorCommands {
            rsync_bin: &self.tools.rsync,
            ssh_bin: &self.tools.ssh,
            local_path: &self.spec.local_path,
            remote_host: self.remote_host,
            remote_path: self.remote_path,
        }
    }

    fn request(&self, key_id: String) -> CertificateRequest {
        CertificateRequest::new(key_id, &self.commands().server(self.spec.direction))
    }
}

impl<R: CommandRunner, I: CertificateIssuer> MirrorSyncJob<'_, R, I> {
    async fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, JobError> {
        let issuer = self.issuer.ok_or(JobError::NoIssuer)?;
        Ok(issuer.issue(request).await?)
    }

    async fn execute(&self) -> BackupResult {
        let mut result = BackupResult::new(self.work_dir.clone());
        let request = self.request(format!("{}-dump-{}", self.hostname, self.name));
        let certificate = match self.issue(&request).await {
            Ok(certificate) => certificate,
            Err(err) => {
                error!(job = %self.name, error = %err, "certificate issuance failed");
                result.fail(None, err);
                return result;
            }
        };
        result.advance(JobPhase::CredentialIssued);

        let local_path = &self.spec.local_path;
        if self.spec.direction == Direction::Pull
            && let Err(err) = fs::create_dir_all(local_path)
        {
            result.fail(None, format!("failed to create {local_path}: {err}"));
            return result;
        }

        let client = self.commands().client(
            self.spec.direction,
            &self.identity.private_key,
            certificate.path(),
        );
        let command_line = client.command_line();
        result.log.info(format!("rsync command: {command_line}"));
        info!(job = %self.name, direction = %self.spec.direction, "running rsync");

        match run_captured(self.runner, &client, &self.tools.gzip, &mut result) {
            Ok(Some(0)) => result.succeed(),
            Ok(code) => {
                error!(job = %self.name, status = %status_text(code), "rsync failed");
                result.fail(
                    code,
                    format!(
                        "rsync failed: {command_line} exited with status {}",
                        status_text(code)
                    ),
                );
            }
            Err(err) => {
                error!(job = %self.name, error = %err, "rsync could not run");
                result.fail(None, err);
            }
        }
        drop(certificate);
        result
    }

    async fn debug_script(&self) -> Result<Utf8PathBuf, JobError> {
        let request = self.request(format!("{}-debug-dump-{}", self.hostname, self.name));
        let certificate = self.issue(&request).await?;
        let certificate_copy = self.work_dir.join(CERTIFICATE_COPY);
        certificate.persist_copy(&certificate_copy)?;

        let client = self.commands().client(
            self.spec.direction,
            &self.identity.private_key,
            &certificate_copy,
        );
        write_script(
            &self.work_dir,
            &format!("#!/bin/sh\n{}\n", client.command_line()),
        )
    }
}

impl<R: CommandRunner, I: CertificateIssuer> ExecutableJob for MirrorSyncJob<'_, R, I> {
    fn run(&self) -> JobFuture<'_, BackupResult> {
        Box::pin(self.execute())
    }

    fn describe(&self) -> JobDescription {
        JobDescription::new(self.name, self.spec, self.hostname)
    }

    fn write_debug_script(&self) -> JobFuture<'_, Result<Utf8PathBuf, JobError>> {
        Box::pin(self.debug_script())
    }
}
