use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HubError, HubResult};

/// Metadata stored alongside each cached file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Manages the on-disk model cache layout.
///
/// Layout: `<cache_dir>/<owner__repo>/<revision>/<filename>`
/// Metadata sidecar: `<filename>.meta.json`
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    /// Create a cache rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> HubResult<Self> {
        let root: PathBuf = root.into();
        let expanded = expand_tilde(&root);
        std::fs::create_dir_all(&expanded).map_err(HubError::Io)?;
        Ok(Self { root: expanded })
    }

    /// Absolute path for a given `(repo_id, revision, filename)` tuple.
    pub fn file_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.model_dir(repo_id, revision).join(filename)
    }

    /// Absolute path for the metadata sidecar of a given file.
    pub fn meta_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        let mut p = self.file_path(repo_id, revision, filename);
        p.set_file_name(format!("{filename}.meta.json"));
        p
    }

    /// Returns `true` if the file is already cached (both data and meta exist).
    pub fn is_cached(&self, repo_id: &str, revision: &str, filename: &str) -> bool {
        self.file_path(repo_id, revision, filename).exists()
            && self.meta_path(repo_id, revision, filename).exists()
    }

    /// Persist file metadata to disk.
    pub fn write_meta(&self, meta: &FileMetadata) -> HubResult<()> {
        let path = self.meta_path(&meta.repo_id, &meta.revision, &meta.filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(HubError::Io)?;
        }
        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(&path, json).map_err(HubError::Io)?;
        debug!("Wrote metadata to {}", path.display());
        Ok(())
    }

    /// Read file metadata from disk.
    pub fn read_meta(
        &self,
        repo_id: &str,
        revision: &str,
        filename: &str,
    ) -> HubResult<FileMetadata> {
        let path = self.meta_path(repo_id, revision, filename);
        let json = std::fs::read_to_string(&path).map_err(HubError::Io)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// The directory where all files for a given `(repo_id, revision)` live.
    ///
    /// This is the model directory handed to `CorefModel::load`.
    pub fn model_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.root.join(repo_id.replace('/', "__")).join(revision)
    }

    /// The root cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_cache() -> (ModelCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        (cache, dir)
    }

    #[test]
    fn test_file_path_encodes_slash() {
        let (cache, _dir) = temp_cache();
        let p = cache.file_path("owner/repo", "main", "config.json");
        let s = p.to_string_lossy();
        assert!(s.contains("owner__repo"), "slash must become double-underscore");
        assert!(s.ends_with("main/config.json"));
    }

    #[test]
    fn test_meta_path_has_suffix() {
        let (cache, _dir) = temp_cache();
        let p = cache.meta_path("a/b", "rev", "model.safetensors");
        assert!(p.to_string_lossy().ends_with("model.safetensors.meta.json"));
    }

    #[test]
    fn test_is_cached_needs_data_and_meta() {
        let (cache, _dir) = temp_cache();
        assert!(!cache.is_cached("test/model", "main", "config.json"));

        let path = cache.file_path("test/model", "main", "config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{}").unwrap();
        assert!(!cache.is_cached("test/model", "main", "config.json"), "no sidecar yet");

        cache
            .write_meta(&FileMetadata {
                repo_id: "test/model".to_string(),
                revision: "main".to_string(),
                filename: "config.json".to_string(),
                sha256: "deadbeef".to_string(),
                size_bytes: 2,
            })
            .unwrap();
        assert!(cache.is_cached("test/model", "main", "config.json"));
        let meta = cache.read_meta("test/model", "main", "config.json").unwrap();
        assert_eq!(meta.sha256, "deadbeef");
        assert_eq!(meta.size_bytes, 2);
    }

    #[test]
    fn test_root_returns_correct_path() {
        let (cache, dir) = temp_cache();
        assert_eq!(cache.root(), dir.path());
    }
}
