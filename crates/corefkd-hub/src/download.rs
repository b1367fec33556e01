use std::path::{Path, PathBuf};

use futures::StreamExt;
use hf_hub::{
    api::tokio::{Api, ApiBuilder},
    Repo, RepoType,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::{
    cache::{FileMetadata, ModelCache},
    error::{HubError, HubResult},
    integrity::{sha256_file, verify_cached},
};

/// Files every coreference model directory needs.
const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];

/// Fetched when present; a missing one is skipped.
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.txt",
    "coref_config.json",
];

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Progress bar template for files whose `Content-Length` is known.
const PB_TEMPLATE_SIZED: &str =
    "{wide_msg}\n[{bar:50.cyan/blue}] {bytes}/{total_bytes}  {bytes_per_sec}  ETA {eta}";

/// Progress bar template when the total size is not known.
const PB_TEMPLATE_SPINNER: &str =
    "{spinner:.green} {wide_msg}  {bytes}  {bytes_per_sec}  [{elapsed_precise}]";

// ─── Downloader ───────────────────────────────────────────────────────────────

/// High-level model downloader.
pub struct ModelDownloader {
    cache: ModelCache,
    api: Api,
    /// Authenticated reqwest client for streaming downloads.
    http: reqwest::Client,
    /// HF Hub bearer token, if available.
    hf_token: Option<String>,
}

impl ModelDownloader {
    /// Create a downloader writing into `cache`.
    ///
    /// Reads `HUGGING_FACE_HUB_TOKEN` from the environment if present.
    pub fn new(cache: ModelCache) -> HubResult<Self> {
        let hf_token = std::env::var("HUGGING_FACE_HUB_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let mut api_builder = ApiBuilder::new();
        if let Some(ref token) = hf_token {
            api_builder = api_builder.with_token(Some(token.clone()));
        }
        let api = api_builder.build().map_err(|e| HubError::DownloadFailed {
            file: "<api init>".into(),
            reason: e.to_string(),
        })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("corefkd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::DownloadFailed {
                file: "<http client>".into(),
                reason: e.to_string(),
            })?;

        Ok(Self { cache, api, http, hf_token })
    }

    // ─── Public entry points ──────────────────────────────────────────────────

    /// Download the configs, tokenizer and safetensors weights of a model.
    ///
    /// Returns the local model directory.
    pub async fn pull(
        &self,
        repo_id: &str,
        revision: &str,
        mp: Option<&MultiProgress>,
    ) -> HubResult<PathBuf> {
        info!(repo_id, revision, "Pulling model");

        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let mut filenames: Vec<String> = REQUIRED_FILES
            .iter()
            .chain(OPTIONAL_FILES)
            .map(|s| s.to_string())
            .collect();

        match repo.get(SAFETENSORS_INDEX).await {
            Ok(index_path) => {
                let index_str = std::fs::read_to_string(&index_path).map_err(HubError::Io)?;
                let index: serde_json::Value = serde_json::from_str(&index_str)?;
                if let Some(weight_map) = index["weight_map"].as_object() {
                    let mut shards: Vec<String> = weight_map
                        .values()
                        .filter_map(|v| v.as_str())
                        .map(String::from)
                        .collect::<std::collections::HashSet<_>>()
                        .into_iter()
                        .collect();
                    shards.sort();
                    filenames.extend(shards);
                    filenames.push(SAFETENSORS_INDEX.to_string());
                }
            }
            Err(_) => {
                filenames.push(SAFETENSORS_SINGLE.to_string());
            }
        }

        filenames.dedup();
        let paths = self.download_all(&repo, repo_id, revision, &filenames, mp).await?;
        info!(files = paths.len(), "Model files ready");
        Ok(self.cache.model_dir(repo_id, revision))
    }

    // ─── Download engine ──────────────────────────────────────────────────────

    /// Download every filename in the list, warning on optional failures.
    /// Returns `Err` if any required file fails.
    async fn download_all(
        &self,
        repo: &hf_hub::api::tokio::ApiRepo,
        repo_id: &str,
        revision: &str,
        filenames: &[String],
        mp: Option<&MultiProgress>,
    ) -> HubResult<Vec<PathBuf>> {
        let mut local_paths = Vec::new();
        let mut failed = Vec::new();

        for filename in filenames {
            match self.download_file(repo, repo_id, revision, filename, mp).await {
                Ok(p) => local_paths.push(p),
                Err(e) if OPTIONAL_FILES.contains(&filename.as_str()) => {
                    debug!(filename, error = %e, "Optional file not available, skipping");
                }
                Err(e) => {
                    warn!(filename, error = %e, "Failed to download required file");
                    failed.push(filename.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(HubError::DownloadFailed {
                file: repo_id.to_string(),
                reason: format!(
                    "required file(s) failed to download: {}. \
                    Check your HUGGING_FACE_HUB_TOKEN if this is a gated repo.",
                    failed.join(", ")
                ),
            });
        }

        Ok(local_paths)
    }

    /// Download a single file with a real-time progress bar.
    ///
    /// Uses `repo.url()` to build the CDN URL, then streams the body via
    /// `reqwest` so every received chunk advances the progress bar immediately.
    /// Writes to `<dest>.tmp` and renames atomically on success.
    async fn download_file(
        &self,
        repo: &hf_hub::api::tokio::ApiRepo,
        repo_id: &str,
        revision: &str,
        filename: &str,
        mp: Option<&MultiProgress>,
    ) -> HubResult<PathBuf> {
        let dest = self.cache.file_path(repo_id, revision, filename);

        if self.cache.is_cached(repo_id, revision, filename) {
            match verify_cached(&self.cache, repo_id, revision, filename) {
                Ok(()) => {
                    debug!(filename, "Already cached, skipping download");
                    return Ok(dest);
                }
                Err(e) => warn!(filename, error = %e, "Cached file is corrupt, downloading again"),
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(HubError::Io)?;
        }

        let url = repo.url(filename);
        info!(filename, "Downloading");

        // ── Build request with optional auth ──────────────────────────────────
        let mut req = self.http.get(&url);
        if let Some(ref token) = self.hf_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req.send().await.map_err(|e| {
            let hint = auth_hint(e.to_string().as_str());
            HubError::DownloadFailed {
                file: filename.to_string(),
                reason: format!("{e}{hint}"),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let hint = if status.as_u16() == 401 || status.as_u16() == 403 {
                " (hint: set HUGGING_FACE_HUB_TOKEN for gated repos)"
            } else {
                ""
            };
            return Err(HubError::DownloadFailed {
                file: filename.to_string(),
                reason: format!("HTTP {status}{hint}"),
            });
        }

        // ── Set up progress bar ───────────────────────────────────────────────
        let content_length = response.content_length();
        let pb: Option<ProgressBar> = mp.map(|m| {
            if let Some(total) = content_length {
                let pb = m.add(ProgressBar::new(total));
                pb.set_style(
                    ProgressStyle::with_template(PB_TEMPLATE_SIZED)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("##-"),
                );
                pb.set_message(filename.to_string());
                pb
            } else {
                let pb = m.add(ProgressBar::new_spinner());
                pb.set_style(
                    ProgressStyle::with_template(PB_TEMPLATE_SPINNER)
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.set_message(filename.to_string());
                pb.enable_steady_tick(std::time::Duration::from_millis(100));
                pb
            }
        });

        // ── Stream to temp file ───────────────────────────────────────────────
        let tmp_path = dest.with_file_name(format!(
            "{}.tmp",
            dest.file_name().unwrap_or_default().to_string_lossy()
        ));

        let result = self
            .stream_to_disk(response, &tmp_path, pb.as_ref())
            .await;

        match result {
            Ok(()) => {
                std::fs::rename(&tmp_path, &dest).map_err(HubError::Io)?;
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        }

        // ── Metadata ──────────────────────────────────────────────────────────
        let sha256 = sha256_file(&dest)?;
        let size_bytes = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        self.cache.write_meta(&FileMetadata {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            filename: filename.to_string(),
            sha256,
            size_bytes,
        })?;

        if let Some(ref pb) = pb {
            pb.finish_with_message(format!("Done  {filename}"));
        }

        Ok(dest)
    }

    /// Write a streaming HTTP response body to `path`, calling `pb.inc()` per chunk.
    async fn stream_to_disk(
        &self,
        response: reqwest::Response,
        path: &Path,
        pb: Option<&ProgressBar>,
    ) -> HubResult<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path).map_err(HubError::Io)?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HubError::DownloadFailed {
                file: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;
            file.write_all(&chunk).map_err(HubError::Io)?;
            if let Some(pb) = pb {
                pb.inc(chunk.len() as u64);
            }
        }

        file.flush().map_err(HubError::Io)?;
        Ok(())
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn auth_hint(msg: &str) -> &'static str {
    if msg.contains("401") || msg.contains("403") {
        " (hint: set HUGGING_FACE_HUB_TOKEN for gated repos)"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_and_optional_files_are_disjoint() {
        for f in REQUIRED_FILES {
            assert!(!OPTIONAL_FILES.contains(f), "{f} listed twice");
        }
    }

    #[test]
    fn auth_hint_only_for_auth_failures() {
        assert!(!auth_hint("HTTP 401 Unauthorized").is_empty());
        assert!(auth_hint("connection reset").is_empty());
    }
}
