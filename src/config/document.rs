//! Serde model of the JSON backup document.
//!
//! Everything here is exactly what the operator wrote. Shared sections are
//! turned into their typed counterparts by the derivation step in
//! [`super`], which reads secret files and fills in derived fields.

use std::fmt;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default mount of the approle auth method.
pub const DEFAULT_AUTH_MOUNT: &str = "approle";

/// Root of the backup document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Document {
    /// Jobs keyed by unique name, in document order.
    pub jobs_by_name: IndexMap<String, JobSpec>,
    /// Snapshot store shared by all restic jobs.
    #[serde(default)]
    pub restic: Option<ResticSection>,
    /// SSH identity and certificate authority shared by all rsync jobs.
    #[serde(default)]
    pub ssh: Option<SshSection>,
}

/// Transport used by a job.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum BackupType {
    /// `rsync` over SSH authenticated with a per-run certificate.
    MirrorSync,
    /// `restic` snapshots stored on B2.
    Snapshot,
}

impl BackupType {
    /// External spelling used in the document and in notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MirrorSync => "rsync",
            Self::Snapshot => "restic-b2",
        }
    }
}

impl TryFrom<String> for BackupType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match normalise(&value).as_str() {
            "rsync" => Ok(Self::MirrorSync),
            "restic-b2" => Ok(Self::Snapshot),
            _ => Err(format!(
                "unknown backup type {value:?}, expected \"rsync\" or \"restic-b2\""
            )),
        }
    }
}

impl From<BackupType> for String {
    fn from(value: BackupType) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a job holds the data.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    /// The local host is the data source.
    Push,
    /// The local host is the data destination.
    Pull,
}

impl Direction {
    /// External spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match normalise(&value).as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            _ => Err(format!(
                "unknown direction {value:?}, expected \"push\" or \"pull\""
            )),
        }
    }
}

impl From<Direction> for String {
    fn from(value: Direction) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalise(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('_', "-")
}

const fn default_one_file_system() -> bool {
    true
}

/// One configured backup job.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobSpec {
    /// Transport used by the job.
    #[serde(rename = "type")]
    pub kind: BackupType,
    /// Which side holds the data.
    pub direction: Direction,
    /// Identifier of the host that runs the job.
    pub local_host: String,
    /// Absolute path on the local host.
    pub local_path: Utf8PathBuf,
    /// Remote host, optionally prefixed with `user@`.
    #[serde(default)]
    pub remote_host: Option<String>,
    /// Absolute path on the remote host.
    #[serde(default)]
    pub remote_path: Option<Utf8PathBuf>,
    /// Whether snapshots stay on the local path's filesystem.
    #[serde(default = "default_one_file_system")]
    pub one_file_system: bool,
    /// File holding the restic repository password.
    #[serde(default)]
    pub password_path: Option<Utf8PathBuf>,
    /// Retention window passed to `restic forget --keep-within`.
    #[serde(default)]
    pub retention: Option<String>,
}

/// `restic` section of the document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResticSection {
    /// Cache directory shared by every repository.
    pub cache_dir: Utf8PathBuf,
    /// B2 bucket and credential files.
    pub b2: B2Section,
}

/// `restic.b2` section of the document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct B2Section {
    /// Bucket holding one repository per job.
    pub bucket: String,
    /// File holding the B2 key id.
    pub key_id_path: Utf8PathBuf,
    /// File holding the B2 application key.
    pub application_key_path: Utf8PathBuf,
}

/// `ssh` section of the document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SshSection {
    /// Public half of the local key pair, sent to the signer.
    pub public_key_path: Utf8PathBuf,
    /// Private half of the local key pair, handed to `ssh -i`.
    pub private_key_path: Utf8PathBuf,
    /// Certificate authority settings.
    pub ca: CaSection,
}

/// `ssh.ca` section of the document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CaSection {
    /// Base URL of the signing service.
    pub addr: String,
    /// File holding the approle role id.
    pub role_id_path: Utf8PathBuf,
    /// File holding the approle secret id.
    pub secret_id_path: Utf8PathBuf,
    /// Mount path of the approle auth method.
    #[serde(default = "default_auth_mount")]
    pub auth_approle_path: String,
    /// TLS server name override.
    #[serde(default)]
    pub tls_server_name: Option<String>,
    /// PEM bundle trusted instead of the built-in roots.
    #[serde(default)]
    pub tls_ca_cert: Option<Utf8PathBuf>,
    /// Mount path of the SSH secrets engine.
    pub engine_path: String,
    /// Role used to sign certificates.
    pub signer_role: String,
}

fn default_auth_mount() -> String {
    DEFAULT_AUTH_MOUNT.to_owned()
}
