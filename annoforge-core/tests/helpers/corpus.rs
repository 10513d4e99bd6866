//! Temporary image corpora

use annoforge_common::events::EventBus;
use annoforge_core::services::{CorpusScanner, PromptRegistry};
use annoforge_core::store::CaptionFiles;
use annoforge_core::CaptionStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Folder of fake images, removed on drop
pub struct TestCorpus {
    dir: TempDir,
}

impl TestCorpus {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Corpus with `count` images named `img00.jpg`, `img01.jpg`, ...
    pub fn with_images(count: usize) -> Self {
        let corpus = Self::new();
        for i in 0..count {
            corpus.image(&format!("img{:02}.jpg", i));
        }
        corpus
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a fake image; contents are never decoded
    pub fn image(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"\x89PNG fake image").unwrap();
        path
    }

    /// Write the caption file for an image
    pub fn caption(&self, image_name: &str, text: &str) {
        let path = self.dir.path().join(image_name).with_extension("txt");
        std::fs::write(path, text).unwrap();
    }

    pub fn read_caption(&self, image_name: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join(image_name).with_extension("txt")).ok()
    }

    pub fn remove(&self, name: &str) {
        std::fs::remove_file(self.dir.path().join(name)).unwrap();
    }

    /// Names of leftover temp files from atomic writes
    pub fn temp_files(&self) -> Vec<String> {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".annoforge-"))
            .collect()
    }
}

/// Store over `corpus` with `default_prompt_type`, already scanned
pub fn open_store(corpus: &TestCorpus, default_prompt_type: &str) -> Arc<CaptionStore> {
    open_store_with(corpus, default_prompt_type, CaptionFiles::new("txt"))
}

pub fn open_store_with(
    corpus: &TestCorpus,
    default_prompt_type: &str,
    files: CaptionFiles,
) -> Arc<CaptionStore> {
    let store = CaptionStore::new(
        PromptRegistry::builtin(),
        default_prompt_type,
        files,
        EventBus::new(256),
    )
    .unwrap();
    CorpusScanner::default().scan(corpus.path(), &store).unwrap();
    Arc::new(store)
}
