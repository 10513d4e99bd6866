//! Corpus scanner
//!
//! Enumerates the supported images of a corpus folder and reconciles the
//! result with the [`CaptionStore`]: new images become records (loading an
//! existing caption file as `Done`), vanished images are removed. Ids are
//! file names relative to the corpus root, so re-scanning an unchanged folder
//! is a no-op.

use crate::error::CoreResult;
use crate::store::CaptionStore;
use annoforge_common::events::AnnotationEvent;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Corpus scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Supported image extensions (lowercase)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// Outcome of one corpus scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Records in the store after the scan
    pub total: usize,
}

/// Image file discovery
pub struct ImageScanner {
    ignore_names: Vec<String>,
    max_depth: usize,
}

impl ImageScanner {
    /// Scanner for the folder itself only (depth 1)
    ///
    /// Ignores dotfiles and system files like `.DS_Store` and `Thumbs.db`.
    pub fn new() -> Self {
        Self {
            ignore_names: vec!["Thumbs.db".to_string(), "desktop.ini".to_string()],
            max_depth: 1,
        }
    }

    /// Directory levels to descend; 1 = the corpus folder itself
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Discover supported images, keyed by id, in id order
    pub fn scan(&self, root_path: &Path) -> Result<BTreeMap<String, PathBuf>, ScanError> {
        if !root_path.exists() {
            return Err(ScanError::PathNotFound(root_path.to_path_buf()));
        }
        if !root_path.is_dir() {
            return Err(ScanError::NotADirectory(root_path.to_path_buf()));
        }

        let mut images = BTreeMap::new();
        let mut symlink_visited = HashSet::new();

        let walker = WalkDir::new(root_path)
            .follow_links(false)
            .max_depth(self.max_depth)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || self.should_process_entry(e, &mut symlink_visited));

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if !is_file_like(&entry) || !is_image_extension(entry.path()) {
                        continue;
                    }
                    match image_id(root_path, entry.path()) {
                        Some(id) => {
                            images.insert(id, entry.path().to_path_buf());
                        }
                        None => tracing::warn!(
                            path = %entry.path().display(),
                            "Skipping image with non-UTF-8 name"
                        ),
                    }
                }
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                }
            }
        }

        warn_caption_collisions(&images);

        tracing::debug!(
            root = %root_path.display(),
            images = images.len(),
            "Image discovery complete"
        );
        Ok(images)
    }

    fn should_process_entry(&self, entry: &DirEntry, symlink_visited: &mut HashSet<PathBuf>) -> bool {
        let file_name = entry.file_name().to_string_lossy();

        if file_name.starts_with('.') || self.ignore_names.iter().any(|n| *n == file_name) {
            return false;
        }

        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !symlink_visited.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }

        true
    }
}

impl Default for ImageScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconciles scanned images with the caption store
pub struct CorpusScanner {
    images: ImageScanner,
}

impl CorpusScanner {
    pub fn new(max_depth: usize) -> Self {
        Self {
            images: ImageScanner::new().with_max_depth(max_depth),
        }
    }

    /// Scan `folder` and bring `store` in line with it
    pub fn scan(&self, folder: &Path, store: &CaptionStore) -> CoreResult<ScanReport> {
        let discovered = self.images.scan(folder)?;

        let mut report = ScanReport::default();

        for id in store.ids() {
            if !discovered.contains_key(&id) {
                store.remove(&id);
                report.removed.push(id);
            }
        }

        for (id, path) in &discovered {
            if store.contains(id) {
                store.upsert(id, path);
                continue;
            }
            let caption = match store.caption_files().read(path) {
                Ok(caption) => caption,
                Err(e) => {
                    tracing::warn!(
                        image_id = %id,
                        path = %store.caption_files().caption_path(path).display(),
                        error = %e,
                        "Unreadable caption file; record left unannotated"
                    );
                    None
                }
            };
            if store.insert_scanned(id, path, caption) {
                report.added.push(id.clone());
            }
        }

        report.total = store.len();

        tracing::info!(
            folder = %folder.display(),
            added = report.added.len(),
            removed = report.removed.len(),
            total = report.total,
            "Corpus scanned"
        );

        store.event_bus().emit_lossy(AnnotationEvent::CorpusScanned {
            folder: folder.to_path_buf(),
            added: report.added.len(),
            removed: report.removed.len(),
            total: report.total,
            timestamp: Utc::now(),
        });

        Ok(report)
    }
}

impl Default for CorpusScanner {
    fn default() -> Self {
        Self::new(1)
    }
}

fn is_file_like(entry: &DirEntry) -> bool {
    entry.file_type().is_file() || (entry.path_is_symlink() && entry.path().is_file())
}

fn is_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// `/`-separated path relative to the corpus root
fn image_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let parts = parts?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Images sharing a stem in one directory share a caption file
fn warn_caption_collisions(images: &BTreeMap<String, PathBuf>) {
    let mut by_stem: HashMap<PathBuf, Vec<&str>> = HashMap::new();
    for (id, path) in images {
        by_stem
            .entry(path.with_extension(""))
            .or_default()
            .push(id.as_str());
    }
    for (stem, ids) in by_stem {
        if ids.len() > 1 {
            tracing::warn!(
                stem = %stem.display(),
                images = ?ids,
                "Images share a caption file"
            );
        }
    }
}
