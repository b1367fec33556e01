//! Turning a `--model`/`--teacher` argument into a local model directory.

use std::path::{Path, PathBuf};

use indicatif::MultiProgress;
use tracing::info;

use crate::{
    cache::{expand_tilde, ModelCache},
    download::ModelDownloader,
    error::{HubError, HubResult},
};

pub const DEFAULT_REVISION: &str = "main";

/// A parsed model reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef {
    Local(PathBuf),
    Hub { repo_id: String, revision: String },
}

impl ModelRef {
    /// Parse `name_or_path`.
    ///
    /// An existing directory wins; anything else must look like
    /// `owner/repo` with an optional `@revision`.
    pub fn parse(name_or_path: &str) -> HubResult<Self> {
        let local = expand_tilde(Path::new(name_or_path));
        if local.is_dir() {
            return Ok(Self::Local(local));
        }

        let (repo_id, revision) = match name_or_path.split_once('@') {
            Some((repo, rev)) if !rev.is_empty() => (repo, rev),
            Some(_) => return Err(HubError::InvalidModelRef(name_or_path.to_string())),
            None => (name_or_path, DEFAULT_REVISION),
        };
        let valid = matches!(
            repo_id.split_once('/'),
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/')
        );
        if !valid {
            return Err(HubError::InvalidModelRef(name_or_path.to_string()));
        }
        Ok(Self::Hub { repo_id: repo_id.to_string(), revision: revision.to_string() })
    }
}

/// Resolve `name_or_path` to a directory holding `config.json`, the
/// tokenizer and weights, downloading into `cache_dir` when needed.
pub async fn resolve_model(
    name_or_path: &str,
    cache_dir: &Path,
    mp: Option<&MultiProgress>,
) -> HubResult<PathBuf> {
    match ModelRef::parse(name_or_path)? {
        ModelRef::Local(dir) => {
            info!(model_dir = %dir.display(), "Using local model directory");
            Ok(dir)
        }
        ModelRef::Hub { repo_id, revision } => {
            let cache = ModelCache::new(cache_dir)?;
            let downloader = ModelDownloader::new(cache)?;
            downloader.pull(&repo_id, &revision, mp).await
        }
    }
}
