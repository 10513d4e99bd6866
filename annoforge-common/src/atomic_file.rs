//! Crash-safe file replacement
//!
//! Contents are written to a temp file created in the destination directory,
//! flushed to disk, then renamed over the destination. The rename is the
//! commit point: until it happens the previous file is untouched. If anything
//! fails on the way the temp file is removed when its handle drops.

use std::io::{self, Write};
use std::path::Path;

/// Prefix of temp files created next to the destination
pub const TEMP_PREFIX: &str = ".annoforge-";

/// Replace `path` with `contents` atomically.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with(path, contents, |_| Ok(()))
}

/// Same as [`write_atomic`] with a hook invoked after the temp file is fully
/// written and synced but before the rename.
///
/// An error returned by the hook aborts the write exactly the way a crash
/// between write and rename would, which makes it useful for fault injection.
pub fn write_atomic_with<F>(path: &Path, contents: &[u8], before_rename: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;

    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    before_rename(temp.path())?;

    temp.persist(path).map_err(|e| e.error)?;

    tracing::trace!(path = %path.display(), bytes = contents.len(), "Atomic write committed");
    Ok(())
}
