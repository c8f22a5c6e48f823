use std::fs;
use std::path::Path;

use tempfile::{Builder, NamedTempFile};

use crate::error::KiraError;

/// Directory holding `path`, `.` for bare file names.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Temp file in the directory of `path`, so a later rename stays on one
/// filesystem.
pub fn temp_file_beside(path: &Path, prefix: &str) -> Result<NamedTempFile, KiraError> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Builder::new()
        .prefix(prefix)
        .tempfile_in(parent)
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

pub fn persist(temp: NamedTempFile, destination: &Path) -> Result<(), KiraError> {
    temp.as_file()
        .sync_all()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(destination)
        .map(|_| ())
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

/// Removes a temp file that must not become output.
pub fn discard(temp: NamedTempFile) {
    let path = temp.path().to_path_buf();
    if let Err(err) = temp.close() {
        tracing::warn!(path = %path.display(), error = %err, "unable to remove partial output");
    }
}
