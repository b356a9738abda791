//! Create-only writes of ceremony artifacts.
//!
//! An output path either did not exist and now holds the complete artifact,
//! or the write failed and the path was left untouched.

use crate::error::{CeremonyError, Result};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Fail if `path` already exists.
pub fn ensure_absent(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(CeremonyError::OutputCollision(path.to_path_buf()));
    }
    Ok(())
}

/// Write `contents` to a new file at `path`.
///
/// The bytes go to a temporary file in the destination directory first, which
/// is then linked into place without replacing anything already there.
///
/// # Example
///
/// ```rust,no_run
/// use ceremony::storage::output::write_new;
///
/// # fn example() -> ceremony::error::Result<()> {
/// write_new("root.pem", b"-----BEGIN CERTIFICATE-----\n")?;
/// # Ok(())
/// # }
/// ```
pub fn write_new(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    ensure_absent(path)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    tmp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == ErrorKind::AlreadyExists {
            CeremonyError::OutputCollision(path.to_path_buf())
        } else {
            CeremonyError::StorageError(e.error)
        }
    })?;

    info!(path = %path.display(), bytes = contents.len(), "wrote output file");
    Ok(())
}
