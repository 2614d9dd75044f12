//! Atomic document writes: temp file in the destination directory, then rename

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::modules::error::{ChatpoolError, ChatpoolResult};

/// Prefix of the temp files, which the pool watcher skips as dot files
pub const TEMP_PREFIX: &str = ".chatpool-";

/// Replace `destination` with `content`. On failure the previous file, if
/// any, is left untouched and the temp file is removed.
pub async fn write_atomic(destination: &Path, content: String) -> ChatpoolResult<()> {
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&destination, content.as_bytes())).await?
}

fn write_atomic_blocking(destination: &Path, bytes: &[u8]) -> ChatpoolResult<()> {
    let write_error = |source: std::io::Error| ChatpoolError::Write {
        path: destination.to_path_buf(),
        source,
    };

    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(write_error)?;
    temp.write_all(bytes).map_err(write_error)?;
    temp.as_file().sync_all().map_err(write_error)?;

    // Keep the mode of the file being replaced
    if let Ok(metadata) = std::fs::metadata(destination) {
        temp.as_file()
            .set_permissions(metadata.permissions())
            .map_err(write_error)?;
    }

    debug!("Renaming {} onto {}", temp.path().display(), destination.display());
    temp.persist(destination).map_err(|e| write_error(e.error))?;
    Ok(())
}
