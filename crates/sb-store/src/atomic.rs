use sb_types::StorageError;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `contents` to `path` so that readers see either the old file or the complete new one.
///
/// The data goes to a temporary file in the destination directory, is synced
/// and then renamed over `path`. Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let write_error = |source: std::io::Error| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_error)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_error)?;
    tmp.write_all(contents).map_err(write_error)?;
    tmp.as_file().sync_all().map_err(write_error)?;
    tmp.persist(path).map_err(|e| write_error(e.error))?;

    tracing::debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}
