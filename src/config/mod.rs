//! Backup document loading, derivation and host-scoped validation.
//!
//! A document is parsed strictly, then the shared sections needed by jobs on
//! the evaluating host are turned into typed values (secrets read from disk,
//! TLS server name derived from the signer address). Every violation found
//! along the way is reported together in a [`ValidationError`].

mod document;
mod validation;

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::files;

pub use document::{
    B2Section, BackupType, CaSection, DEFAULT_AUTH_MOUNT, Direction, Document, JobSpec,
    ResticSection, SshSection,
};
pub use validation::{ValidationError, Violation, ViolationKind};

use validation::{check_job, check_sections, job_location, require_directory, require_file};

/// Environment variable carrying the B2 key id to `restic`.
pub const B2_ACCOUNT_ID_ENV: &str = "B2_ACCOUNT_ID";
/// Environment variable carrying the B2 application key to `restic`.
pub const B2_ACCOUNT_KEY_ENV: &str = "B2_ACCOUNT_KEY";

/// Shared snapshot store used by every `restic-b2` job.
#[derive(Clone, Eq, PartialEq)]
pub struct SnapshotStoreConfig {
    /// Cache directory shared by every repository.
    pub cache_dir: Utf8PathBuf,
    /// Bucket holding one repository per job.
    pub bucket: String,
    /// B2 key id.
    pub key_id: String,
    /// B2 application key.
    pub application_key: String,
}

impl SnapshotStoreConfig {
    /// Repository URL for `job_name`.
    #[must_use]
    pub fn repository(&self, job_name: &str) -> String {
        format!("b2:{}:{job_name}", self.bucket)
    }

    /// Environment passed to `restic` so it can reach the bucket.
    #[must_use]
    pub fn credential_env(&self) -> [(&'static str, &str); 2] {
        [
            (B2_ACCOUNT_ID_ENV, self.key_id.as_str()),
            (B2_ACCOUNT_KEY_ENV, self.application_key.as_str()),
        ]
    }
}

impl fmt::Debug for SnapshotStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("bucket", &self.bucket)
            .field("key_id", &"<redacted>")
            .field("application_key", &"<redacted>")
            .finish()
    }
}

/// Local SSH key pair presented together with an issued certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportIdentity {
    /// Public key sent to the signer.
    pub public_key: Utf8PathBuf,
    /// Private key handed to `ssh -i`.
    pub private_key: Utf8PathBuf,
}

/// Connection and signing settings for the certificate authority.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CredentialAuthorityConfig {
    /// Base URL of the signing service.
    pub addr: String,
    /// File holding the approle role id.
    pub role_id_path: Utf8PathBuf,
    /// File holding the approle secret id.
    pub secret_id_path: Utf8PathBuf,
    /// Mount path of the approle auth method.
    pub auth_mount: String,
    /// Name verified against the signer's TLS certificate.
    pub tls_server_name: String,
    /// PEM bundle trusted instead of the built-in roots.
    pub tls_ca_cert: Option<Utf8PathBuf>,
    /// Mount path of the SSH secrets engine.
    pub engine_path: String,
    /// Role used to sign certificates.
    pub signer_role: String,
}

/// Everything `rsync` jobs need to authenticate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportConfig {
    /// Local key pair.
    pub identity: TransportIdentity,
    /// Certificate authority.
    pub authority: CredentialAuthorityConfig,
}

/// Errors raised while loading the backup document.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The document could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Document path.
        path: Utf8PathBuf,
        /// Human-readable reason.
        message: String,
    },
    /// The document is not valid JSON for the expected shape.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// The document parsed but violates one or more invariants.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Clone, Copy, Debug, Default)]
struct LocalDemand {
    mirror: usize,
    snapshot: usize,
}

impl LocalDemand {
    fn count<'a>(jobs: impl IntoIterator<Item = &'a JobSpec>, local_host: &str) -> Self {
        let mut demand = Self::default();
        for job in jobs.into_iter().filter(|job| job.local_host == local_host) {
            match job.kind {
                BackupType::MirrorSync => demand.mirror += 1,
                BackupType::Snapshot => demand.snapshot += 1,
            }
        }
        demand
    }
}

/// Validated backup configuration for one host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    jobs: IndexMap<String, JobSpec>,
    snapshot_store: Option<SnapshotStoreConfig>,
    transport: Option<TransportConfig>,
}

impl Config {
    /// Reads and validates the document at `path` for `local_host`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise
    /// the errors of [`Config::from_json`].
    pub fn load(path: &Utf8Path, local_host: &str) -> Result<Self, ConfigError> {
        let text = files::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
        Self::from_json(&text, local_host)
    }

    /// Parses and validates a JSON document for `local_host`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::Invalid`] carrying every violation otherwise.
    pub fn from_json(text: &str, local_host: &str) -> Result<Self, ConfigError> {
        let document: Document =
            serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_document(document, local_host)
    }

    /// Derives and validates a parsed document for `local_host`.
    ///
    /// Secret files of a shared section are only read when a job on
    /// `local_host` needs that section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] carrying every violation.
    pub fn from_document(document: Document, local_host: &str) -> Result<Self, ConfigError> {
        let demand = LocalDemand::count(document.jobs_by_name.values(), local_host);
        let mut violations = check_sections(&document);

        let snapshot_store = document
            .restic
            .as_ref()
            .filter(|_| demand.snapshot > 0)
            .and_then(|section| derive_snapshot_store(section, &mut violations));
        let transport = document
            .ssh
            .as_ref()
            .filter(|_| demand.mirror > 0)
            .and_then(|section| derive_transport(section, &mut violations));

        let has_restic = document.restic.is_some();
        let has_ssh = document.ssh.is_some();
        let config = Self {
            jobs: document.jobs_by_name,
            snapshot_store,
            transport,
        };

        // A present section whose derivation failed already has violations.
        violations.extend(config.violations(local_host).into_iter().filter(|violation| {
            violation.kind != ViolationKind::MissingSection
                || (violation.location == "restic" && !has_restic)
                || (violation.location == "ssh" && !has_ssh)
        }));

        if violations.is_empty() {
            Ok(config)
        } else {
            Err(ValidationError::new(local_host, violations).into())
        }
    }

    /// Re-validates this configuration for `local_host`. A configuration
    /// that was built for the same host validates cleanly again.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] carrying every violation.
    pub fn validate(&self, local_host: &str) -> Result<(), ValidationError> {
        let violations = self.violations(local_host);
        if violations.is_empty() {
            return Ok(());
        }
        Err(ValidationError::new(local_host, violations))
    }

    fn violations(&self, local_host: &str) -> Vec<Violation> {
        let mut violations: Vec<Violation> = self
            .jobs
            .iter()
            .flat_map(|(name, job)| check_job(name, job))
            .collect();

        let demand = LocalDemand::count(self.jobs.values(), local_host);
        if demand.snapshot > 0 {
            self.check_snapshot_store(local_host, &mut violations);
        }
        if demand.mirror > 0 {
            self.check_transport(&mut violations);
        }
        violations
    }

    fn check_snapshot_store(&self, local_host: &str, violations: &mut Vec<Violation>) {
        for (name, job) in self.local_jobs(local_host) {
            if job.kind != BackupType::Snapshot {
                continue;
            }
            if let Some(password_path) = &job.password_path {
                require_file(
                    violations,
                    &job_location(name, "passwordPath"),
                    password_path,
                );
            }
        }

        let Some(store) = &self.snapshot_store else {
            violations.push(Violation::new(
                "restic",
                ViolationKind::MissingSection,
                Value::Null,
            ));
            return;
        };
        require_directory(violations, "restic.cacheDir", &store.cache_dir);
    }

    fn check_transport(&self, violations: &mut Vec<Violation>) {
        let Some(transport) = &self.transport else {
            violations.push(Violation::new(
                "ssh",
                ViolationKind::MissingSection,
                Value::Null,
            ));
            return;
        };
        let identity = &transport.identity;
        let authority = &transport.authority;
        require_file(violations, "ssh.publicKeyPath", &identity.public_key);
        require_file(violations, "ssh.privateKeyPath", &identity.private_key);
        require_file(violations, "ssh.ca.roleIdPath", &authority.role_id_path);
        require_file(violations, "ssh.ca.secretIdPath", &authority.secret_id_path);
        if let Some(tls_ca_cert) = &authority.tls_ca_cert {
            require_file(violations, "ssh.ca.tlsCaCert", tls_ca_cert);
        }
    }

    /// All jobs in document order.
    #[must_use]
    pub const fn jobs(&self) -> &IndexMap<String, JobSpec> {
        &self.jobs
    }

    /// Looks up a job by name.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<(&str, &JobSpec)> {
        self.jobs
            .get_key_value(name)
            .map(|(key, job)| (key.as_str(), job))
    }

    /// Jobs run by `local_host`, in document order.
    pub fn local_jobs<'a>(
        &'a self,
        local_host: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a JobSpec)> + 'a {
        self.jobs
            .iter()
            .filter(move |(_, job)| job.local_host == local_host)
            .map(|(name, job)| (name.as_str(), job))
    }

    /// Snapshot store, present when a local job needs it.
    #[must_use]
    pub const fn snapshot_store(&self) -> Option<&SnapshotStoreConfig> {
        self.snapshot_store.as_ref()
    }

    /// SSH identity and certificate authority, present when a local job
    /// needs them.
    #[must_use]
    pub const fn transport(&self) -> Option<&TransportConfig> {
        self.transport.as_ref()
    }
}

/// Extracts the host name of `addr`, without IPv6 brackets.
#[must_use]
pub fn derive_server_name(addr: &str) -> Option<String> {
    let url = reqwest::Url::parse(addr).ok()?;
    let host = url
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_owned())
}

fn derive_snapshot_store(
    section: &ResticSection,
    violations: &mut Vec<Violation>,
) -> Option<SnapshotStoreConfig> {
    let key_id = read_secret("restic.b2.keyIdPath", &section.b2.key_id_path, violations);
    let application_key = read_secret(
        "restic.b2.applicationKeyPath",
        &section.b2.application_key_path,
        violations,
    );
    Some(SnapshotStoreConfig {
        cache_dir: section.cache_dir.clone(),
        bucket: section.b2.bucket.clone(),
        key_id: key_id?,
        application_key: application_key?,
    })
}

fn derive_transport(
    section: &SshSection,
    violations: &mut Vec<Violation>,
) -> Option<TransportConfig> {
    let ca = &section.ca;
    let server_name = ca
        .tls_server_name
        .clone()
        .or_else(|| derive_server_name(&ca.addr));
    let Some(tls_server_name) = server_name else {
        violations.push(Violation::new(
            "ssh.ca.addr",
            ViolationKind::MissingHostname,
            Value::String(ca.addr.clone()),
        ));
        return None;
    };

    Some(TransportConfig {
        identity: TransportIdentity {
            public_key: section.public_key_path.clone(),
            private_key: section.private_key_path.clone(),
        },
        authority: CredentialAuthorityConfig {
            addr: ca.addr.clone(),
            role_id_path: ca.role_id_path.clone(),
            secret_id_path: ca.secret_id_path.clone(),
            auth_mount: ca.auth_approle_path.clone(),
            tls_server_name,
            tls_ca_cert: ca.tls_ca_cert.clone(),
            engine_path: ca.engine_path.clone(),
            signer_role: ca.signer_role.clone(),
        },
    })
}

fn read_secret(location: &str, path: &Utf8Path, violations: &mut Vec<Violation>) -> Option<String> {
    match files::read_to_string(path) {
        Ok(text) => Some(text.trim_end().to_owned()),
        Err(err) => {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ViolationKind::PathNotFile
            } else {
                ViolationKind::Unreadable
            };
            violations.push(
                Violation::new(location, kind, Value::String(path.as_str().to_owned()))
                    .with_detail(err.to_string()),
            );
            None
        }
    }
}
