//! Persisted file store seam

use std::path::{Path, PathBuf};
use crate::format::KeyValueFile;
use crate::Result;

/// Read-only access to persisted files
pub trait FileStore: Send + Sync {
    fn file_exists(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Open a structured key/value file
    fn open_key_value(&self, path: &Path) -> Result<KeyValueFile> {
        let text = self.read_to_string(path)?;
        KeyValueFile::parse(path, &text)
    }
}

/// File store backed by the local filesystem, optionally rooted at a directory
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore {
    root: Option<PathBuf>,
}

impl LocalFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every path (absolute ones included) below `root`
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }
}

impl FileStore for LocalFileStore {
    fn file_exists(&self, path: &Path) -> bool {
        self.resolve(path).is_file()
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(std::fs::read_to_string(self.resolve(path))?)
    }
}
