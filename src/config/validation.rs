//! Violations collected while validating a backup document.

use std::fmt;
use std::fs;

use camino::Utf8Path;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use super::document::{BackupType, Direction, Document, JobSpec};

/// Machine-readable category of a [`Violation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ViolationKind {
    /// A required field is absent.
    Missing,
    /// A required field is present but blank.
    Empty,
    /// A path must be absolute.
    NotAbsolute,
    /// The job type does not support the configured direction.
    DirectionNotAllowed,
    /// A shared section is needed by local jobs but absent.
    MissingSection,
    /// A path should name an existing file.
    PathNotFile,
    /// A path should name an existing directory.
    PathNotDirectory,
    /// A secret file could not be read.
    Unreadable,
    /// No TLS server name could be derived from the address.
    MissingHostname,
}

impl ViolationKind {
    /// Stable identifier of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Empty => "empty",
            Self::NotAbsolute => "not_absolute",
            Self::DirectionNotAllowed => "direction_not_allowed",
            Self::MissingSection => "missing_section",
            Self::PathNotFile => "path_not_file",
            Self::PathNotDirectory => "path_not_directory",
            Self::Unreadable => "unreadable",
            Self::MissingHostname => "missing_hostname",
        }
    }

    const fn message(self) -> &'static str {
        match self {
            Self::Missing => "field required",
            Self::Empty => "value must not be empty",
            Self::NotAbsolute => "path must be absolute",
            Self::DirectionNotAllowed => "restic-b2 jobs only support the push direction",
            Self::MissingSection => "section required by jobs on this host",
            Self::PathNotFile => "path does not point to a file",
            Self::PathNotDirectory => "path does not point to a directory",
            Self::Unreadable => "file could not be read",
            Self::MissingHostname => "could not derive a TLS server name from the address",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found in the document.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    /// Dotted path of the offending field, such as
    /// `jobsByName.home.remotePath`.
    pub location: String,
    /// Category of the problem.
    pub kind: ViolationKind,
    /// Offending input value, `null` when absent.
    pub input: Value,
    /// Extra detail, such as the I/O error behind [`ViolationKind::Unreadable`].
    pub detail: Option<String>,
}

impl Violation {
    /// Creates a violation without extra detail.
    #[must_use]
    pub fn new(location: impl Into<String>, kind: ViolationKind, input: Value) -> Self {
        Self {
            location: location.into(),
            kind,
            input,
            detail: None,
        }
    }

    /// Attaches extra detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Human-readable description without the location.
    #[must_use]
    pub fn message(&self) -> String {
        self.detail.as_ref().map_or_else(
            || self.kind.message().to_owned(),
            |detail| format!("{}: {detail}", self.kind.message()),
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (input_value={})",
            self.location,
            self.message(),
            self.input
        )
    }
}

/// Every violation found for one host.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{} validation errors in config for {host}", .violations.len())]
pub struct ValidationError {
    /// Host the document was evaluated for.
    pub host: String,
    /// Violations in discovery order.
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Bundles violations found for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self {
            host: host.into(),
            violations,
        }
    }

    /// Drops violations about files or directories that do not exist, for
    /// checks run away from the target host. Returns `None` when nothing else
    /// remains.
    #[must_use]
    pub fn without_missing_paths(self) -> Option<Self> {
        let violations: Vec<Violation> = self
            .violations
            .into_iter()
            .filter(|violation| {
                !matches!(
                    violation.kind,
                    ViolationKind::PathNotFile | ViolationKind::PathNotDirectory
                )
            })
            .collect();
        if violations.is_empty() {
            return None;
        }
        Some(Self::new(self.host, violations))
    }

    /// Renders the header followed by violations grouped by location:
    ///
    /// ```text
    /// 2 validation errors in config for host.example:
    /// - jobsByName.home.remotePath:
    ///   - field required (input_value=null)
    /// ```
    #[must_use]
    pub fn render_grouped(&self) -> String {
        let mut groups: IndexMap<&str, Vec<&Violation>> = IndexMap::new();
        for violation in &self.violations {
            groups
                .entry(violation.location.as_str())
                .or_default()
                .push(violation);
        }

        let mut rendered = format!("{self}:");
        for (location, members) in groups {
            rendered.push_str(&format!("\n- {location}:"));
            for violation in members {
                rendered.push_str(&format!(
                    "\n  - {} (input_value={})",
                    violation.message(),
                    violation.input
                ));
            }
        }
        rendered
    }
}

pub(super) fn job_location(name: &str, field: &str) -> String {
    format!("jobsByName.{name}.{field}")
}

fn path_value(path: &Utf8Path) -> Value {
    Value::String(path.as_str().to_owned())
}

/// Host-independent invariants of one job.
pub(super) fn check_job(name: &str, job: &JobSpec) -> Vec<Violation> {
    let mut violations = Vec::new();

    if job.local_host.trim().is_empty() {
        violations.push(Violation::new(
            job_location(name, "localHost"),
            ViolationKind::Empty,
            Value::String(job.local_host.clone()),
        ));
    }
    if !job.local_path.is_absolute() {
        violations.push(Violation::new(
            job_location(name, "localPath"),
            ViolationKind::NotAbsolute,
            path_value(&job.local_path),
        ));
    }

    match job.kind {
        BackupType::MirrorSync => {
            match job.remote_host.as_deref() {
                None => violations.push(Violation::new(
                    job_location(name, "remoteHost"),
                    ViolationKind::Missing,
                    Value::Null,
                )),
                Some(host) if host.trim().is_empty() => violations.push(Violation::new(
                    job_location(name, "remoteHost"),
                    ViolationKind::Empty,
                    Value::String(host.to_owned()),
                )),
                Some(_) => {}
            }
            match job.remote_path.as_deref() {
                None => violations.push(Violation::new(
                    job_location(name, "remotePath"),
                    ViolationKind::Missing,
                    Value::Null,
                )),
                Some(path) if !path.is_absolute() => violations.push(Violation::new(
                    job_location(name, "remotePath"),
                    ViolationKind::NotAbsolute,
                    path_value(path),
                )),
                Some(_) => {}
            }
        }
        BackupType::Snapshot => {
            match job.retention.as_deref() {
                None => violations.push(Violation::new(
                    job_location(name, "retention"),
                    ViolationKind::Missing,
                    Value::Null,
                )),
                Some(retention) if retention.trim().is_empty() => {
                    violations.push(Violation::new(
                        job_location(name, "retention"),
                        ViolationKind::Empty,
                        Value::String(retention.to_owned()),
                    ));
                }
                Some(_) => {}
            }
            if job.password_path.is_none() {
                violations.push(Violation::new(
                    job_location(name, "passwordPath"),
                    ViolationKind::Missing,
                    Value::Null,
                ));
            }
            if job.direction == Direction::Pull {
                violations.push(Violation::new(
                    job_location(name, "direction"),
                    ViolationKind::DirectionNotAllowed,
                    Value::String(job.direction.as_str().to_owned()),
                ));
            }
        }
    }

    violations
}

/// Structural checks on shared sections, applied whenever they are present.
pub(super) fn check_sections(document: &Document) -> Vec<Violation> {
    let mut violations = Vec::new();
    if let Some(restic) = &document.restic {
        require_text(&mut violations, "restic.b2.bucket", &restic.b2.bucket);
    }
    if let Some(ssh) = &document.ssh {
        require_text(&mut violations, "ssh.ca.addr", &ssh.ca.addr);
        require_text(&mut violations, "ssh.ca.enginePath", &ssh.ca.engine_path);
        require_text(&mut violations, "ssh.ca.signerRole", &ssh.ca.signer_role);
        require_text(
            &mut violations,
            "ssh.ca.authApprolePath",
            &ssh.ca.auth_approle_path,
        );
    }
    violations
}

fn require_text(violations: &mut Vec<Violation>, location: &str, value: &str) {
    if value.trim().is_empty() {
        violations.push(Violation::new(
            location,
            ViolationKind::Empty,
            Value::String(value.to_owned()),
        ));
    }
}

/// Records [`ViolationKind::PathNotFile`] unless `path` is an existing file.
pub(super) fn require_file(violations: &mut Vec<Violation>, location: &str, path: &Utf8Path) {
    let is_file = fs::metadata(path).is_ok_and(|metadata| metadata.is_file());
    if !is_file {
        violations.push(Violation::new(
            location,
            ViolationKind::PathNotFile,
            path_value(path),
        ));
    }
}

/// Records [`ViolationKind::PathNotDirectory`] unless `path` is an existing
/// directory.
pub(super) fn require_directory(
    violations: &mut Vec<Violation>,
    location: &str,
    path: &Utf8Path,
) {
    let is_dir = fs::metadata(path).is_ok_and(|metadata| metadata.is_dir());
    if !is_dir {
        violations.push(Violation::new(
            location,
            ViolationKind::PathNotDirectory,
            path_value(path),
        ));
    }
}
