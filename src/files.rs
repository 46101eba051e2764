//! Filesystem helpers for secrets, keys and generated scripts.
//!
//! Reads go through a capability handle opened on the file's parent
//! directory, mirroring how the settings loader reads configuration.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;

fn open_parent(path: &Utf8Path) -> io::Result<(Dir, &str)> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} does not name a file"),
        )
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, file_name))
}

/// Reads a UTF-8 text file.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent directory or the file
/// cannot be opened, or when the contents are not valid UTF-8.
pub fn read_to_string(path: &Utf8Path) -> io::Result<String> {
    let (dir, file_name) = open_parent(path)?;
    dir.read_to_string(file_name)
}

/// Reads a file as raw bytes.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be read.
pub fn read(path: &Utf8Path) -> io::Result<Vec<u8>> {
    let (dir, file_name) = open_parent(path)?;
    dir.read(file_name)
}

/// Writes `contents` to `path`, creating or truncating it, and applies
/// `mode` to the resulting file.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be written or its
/// permissions cannot be set.
pub fn write_with_mode(path: &Utf8Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    file.flush()?;
    // The creation mode is masked by the umask and ignored for existing files.
    fs::set_permissions(path, Permissions::from_mode(mode))
}
