//! Mount precondition for jobs: a job only runs when the filesystem its
//! local path lives on is actually mounted, so an absent disk never gets
//! mirrored as an empty tree.

use std::ffi::OsString;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::process::{CommandRunner, ProcessError};

/// Answers whether the filesystem backing a path is mounted.
pub trait MountOracle {
    /// Returns `true` when the fstab filesystem containing `path` is mounted.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] when the mount tables cannot be read.
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, MountError>;
}

/// Errors raised while querying mount tables.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MountError {
    /// `findmnt` failed to run or exited unsuccessfully.
    #[error(transparent)]
    Command(#[from] ProcessError),
    /// `findmnt` printed something other than the expected JSON.
    #[error("could not parse findmnt output: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct FindmntTable {
    #[serde(default)]
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    target: Utf8PathBuf,
    #[serde(default)]
    children: Vec<FindmntEntry>,
}

impl FindmntEntry {
    fn collect_targets(self, targets: &mut Vec<Utf8PathBuf>) {
        targets.push(self.target);
        for child in self.children {
            child.collect_targets(targets);
        }
    }
}

/// Parses `findmnt --json` output into the list of mount targets.
///
/// # Errors
///
/// Returns [`MountError::Parse`] when `output` is not findmnt JSON.
pub fn parse_targets(output: &str) -> Result<Vec<Utf8PathBuf>, MountError> {
    let table: FindmntTable =
        serde_json::from_str(output).map_err(|err| MountError::Parse(err.to_string()))?;
    let mut targets = Vec::new();
    for entry in table.filesystems {
        entry.collect_targets(&mut targets);
    }
    Ok(targets)
}

/// Picks the longest fstab target that contains `path` and reports whether
/// it is among the mounted targets. Paths outside every fstab entry count as
/// unmounted.
#[must_use]
pub fn backing_filesystem_is_mounted(
    path: &Utf8Path,
    fstab: &[Utf8PathBuf],
    mounted: &[Utf8PathBuf],
) -> bool {
    fstab
        .iter()
        .filter(|target| path.starts_with(target))
        .max_by_key(|target| target.as_str().len())
        .is_some_and(|filesystem| mounted.contains(filesystem))
}

/// Canonicalizes `path` where possible and falls back to its parent when it
/// is not a directory, since `findmnt --target` needs an existing location.
fn resolve_directory(path: &Utf8Path) -> Utf8PathBuf {
    let resolved = fs::canonicalize(path)
        .ok()
        .and_then(|canonical| Utf8PathBuf::from_path_buf(canonical).ok())
        .unwrap_or_else(|| path.to_owned());
    if resolved.is_dir() {
        return resolved;
    }
    resolved
        .parent()
        .map_or_else(|| resolved.clone(), Utf8Path::to_owned)
}

/// [`MountOracle`] backed by `findmnt`.
#[derive(Clone, Debug)]
pub struct FindmntOracle<R> {
    findmnt_bin: String,
    runner: R,
}

impl<R: CommandRunner> FindmntOracle<R> {
    /// Creates an oracle running `findmnt_bin` through `runner`.
    #[must_use]
    pub fn new(findmnt_bin: impl Into<String>, runner: R) -> Self {
        Self {
            findmnt_bin: findmnt_bin.into(),
            runner,
        }
    }

    fn targets(&self, args: &[&str]) -> Result<Vec<Utf8PathBuf>, MountError> {
        let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
        let output = self
            .runner
            .run(&self.findmnt_bin, &argv)?
            .into_success(&self.findmnt_bin)?;
        parse_targets(&output.stdout)
    }
}

impl<R: CommandRunner> MountOracle for FindmntOracle<R> {
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, MountError> {
        let resolved = resolve_directory(path);
        let fstab = self.targets(&["--json", "--fstab"])?;
        let mounted = self.targets(&["--json", "--target", resolved.as_str()])?;
        let answer = backing_filesystem_is_mounted(&resolved, &fstab, &mounted);
        debug!(path = %path, resolved = %resolved, mounted = answer, "checked mount state");
        Ok(answer)
    }
}
