//! Caption sidecar files
//!
//! One plain-text file per image, next to the image, named after the image
//! stem (`photo.jpg` → `photo.txt`). The whole file is the caption; there is
//! no header.

use annoforge_common::atomic_file::write_atomic_with;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hook run between temp-file write and rename (fault injection)
pub type CommitHook = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

/// Reads and writes caption sidecar files
#[derive(Clone)]
pub struct CaptionFiles {
    extension: String,
    commit_hook: Option<CommitHook>,
}

impl CaptionFiles {
    pub fn new(extension: impl Into<String>) -> Self {
        let extension = extension.into();
        let extension = extension.trim_start_matches('.').to_string();
        Self {
            extension: if extension.is_empty() {
                "txt".to_string()
            } else {
                extension
            },
            commit_hook: None,
        }
    }

    /// Install a hook called after the temp file is written, before rename
    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.commit_hook = Some(hook);
        self
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Caption file location for an image
    pub fn caption_path(&self, image_path: &Path) -> PathBuf {
        image_path.with_extension(&self.extension)
    }

    /// Read the caption for an image; `Ok(None)` when no caption file exists
    pub fn read(&self, image_path: &Path) -> io::Result<Option<String>> {
        let path = self.caption_path(image_path);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the caption file crash-safely; returns the caption file path
    pub fn write(&self, image_path: &Path, text: &str) -> io::Result<PathBuf> {
        let path = self.caption_path(image_path);
        write_atomic_with(&path, text.as_bytes(), |temp| match &self.commit_hook {
            Some(hook) => hook(temp),
            None => Ok(()),
        })?;
        Ok(path)
    }
}

impl std::fmt::Debug for CaptionFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptionFiles")
            .field("extension", &self.extension)
            .field("commit_hook", &self.commit_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_path_replaces_extension() {
        let files = CaptionFiles::new("txt");
        assert_eq!(
            files.caption_path(Path::new("/corpus/img1.jpg")),
            PathBuf::from("/corpus/img1.txt")
        );
    }

    #[test]
    fn test_extension_normalized() {
        assert_eq!(CaptionFiles::new(".caption").extension(), "caption");
        assert_eq!(CaptionFiles::new("").extension(), "txt");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let files = CaptionFiles::new("txt");
        assert_eq!(files.read(&dir.path().join("a.png")).unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let files = CaptionFiles::new("txt");
        let image = dir.path().join("a.png");

        let written = files.write(&image, "line one\nline two").unwrap();
        assert_eq!(written, dir.path().join("a.txt"));
        assert_eq!(files.read(&image).unwrap().as_deref(), Some("line one\nline two"));
    }
}
