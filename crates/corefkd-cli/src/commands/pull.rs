use indicatif::MultiProgress;
use tracing::info;

use corefkd_hub::{ModelCache, ModelDownloader, ModelRef};

use crate::config::{expand_cache_dir, AppConfig};

/// Download a model from Hugging Face Hub into the local cache.
///
/// `model` is `owner/repo` with an optional `@revision`; `--revision`
/// overrides the embedded one.
pub async fn run(model: &str, revision: Option<&str>, config: &AppConfig) -> anyhow::Result<()> {
    let (repo_id, parsed_revision) = match ModelRef::parse(model)? {
        ModelRef::Hub { repo_id, revision } => (repo_id, revision),
        ModelRef::Local(dir) => {
            println!("'{}' is a local directory, nothing to pull", dir.display());
            return Ok(());
        }
    };
    let revision = revision.map(str::to_string).unwrap_or(parsed_revision);
    let cache_dir = expand_cache_dir(&config.model.cache_dir);

    info!(repo_id, revision, cache_dir = %cache_dir.display(), "Pulling model");

    let cache = ModelCache::new(&cache_dir)?;
    let downloader = ModelDownloader::new(cache)?;
    let mp = MultiProgress::new();
    let model_dir = downloader.pull(&repo_id, &revision, Some(&mp)).await?;

    let mut files: Vec<String> = std::fs::read_dir(&model_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.ends_with(".meta.json"))
        .collect();
    files.sort();

    println!("\nModel '{repo_id}@{revision}' cached to {}", model_dir.display());
    println!("{} file(s):", files.len());
    for f in &files {
        println!("  {f}");
    }

    Ok(())
}
