//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Read file contents with standardized error handling.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Read raw bytes, returning `None` when the file does not exist.
pub fn read_optional(path: &Path, operation: &str) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::internal_io(
            e.to_string(),
            Some(operation.to_string()),
        )),
    }
}

pub fn ensure_dir(path: &Path, operation: &str) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Write content to file atomically (write to a sibling temp file, then rename).
///
/// The rename is atomic on POSIX filesystems, so readers see either the old
/// content or the new content. Missing parent directories are created.
pub fn write_file_atomic(path: &Path, content: &str, operation: &str) -> Result<()> {
    write_bytes_atomic(path, content.as_bytes(), operation)
}

pub fn write_bytes_atomic(path: &Path, content: &[u8], operation: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        )
    })?;

    let filename = path.file_name().ok_or_else(|| {
        Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        )
    })?;

    if !parent.as_os_str().is_empty() {
        ensure_dir(parent, operation)?;
    }

    let tmp_path = parent.join(format!(
        ".{}.{}.tmp",
        filename.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    fs::write(&tmp_path, content).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("{} (write temp)", operation)))
    })?;

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::internal_io(
            e.to_string(),
            Some(format!("{} (rename)", operation)),
        ));
    }

    Ok(())
}
