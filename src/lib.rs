//! Core library for the keel backup tool.
//!
//! Each host runs the jobs of a shared JSON document that name it as their
//! `localHost`. Mirror jobs drive `rsync` over SSH with a short-lived
//! certificate whose forced command pins the remote `rsync --server`
//! invocation; snapshot jobs run `restic` against a Backblaze B2 bucket.
//! Every job ends with a status mail carrying its execution log and the
//! compressed output of the backup tool.

pub mod ca;
pub mod capture;
pub mod certificate;
pub mod config;
pub mod dump;
pub mod files;
pub mod job;
pub mod mount;
pub mod notify;
pub mod process;
pub mod restore;
pub mod rsync;
pub mod settings;
pub mod test_support;

pub use ca::{CaClient, CaError, CertificateIssuer, CertificateRequest, IssuedCertificate};
pub use capture::{BackupResult, CaptureError, ExecutionLog, JobPhase, OutputCapture};
pub use certificate::{CertificateError, CertificateInfo, client_key_from_auth_info};
pub use config::{BackupType, Config, ConfigError, Direction, JobSpec, ValidationError};
pub use dump::{Dump, DumpError, DumpSummary, setup_debug_script};
pub use job::{
    BackupJob, DispatchError, ExecutableJob, JobDescription, JobEnvironment, JobError, JobStatus,
    build_job,
};
pub use mount::{FindmntOracle, MountError, MountOracle};
pub use notify::{Mailer, NotificationOutcome, Notifier, NotifyError, SmtpMailer, StatusReport};
pub use process::{ChildStdio, CommandRunner, CommandSpec, ProcessCommandRunner, ProcessError};
pub use restore::{Restore, RestoreError};
pub use rsync::{MirrorCommands, authorized_keys};
pub use settings::{Settings, SettingsError, ToolPaths};
