use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use corefkd_core::HeadConfig;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub model: ModelCacheConfig,
    pub device: DeviceConfig,
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub head: HeadConfig,
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCacheConfig {
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// Student encoder window, `[CLS]` and `[SEP]` included.
    pub max_segment_len: usize,
    /// Padded-token budget of one batch.
    pub max_tokens_in_batch: usize,
    pub eval_split: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    pub num_train_epochs: usize,
    pub learning_rate: f64,
    pub head_learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub warmup_steps: usize,
    pub max_grad_norm: f64,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub seed: u64,
    pub temperature: f64,
    pub alpha: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    pub dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelCacheConfig {
                cache_dir: "~/.cache/corefkd".to_string(),
            },
            device: DeviceConfig {
                prefer_gpu: true,
                cuda_device_id: 0,
            },
            data: DataConfig {
                max_segment_len: 512,
                max_tokens_in_batch: 5000,
                eval_split: "dev".to_string(),
            },
            training: TrainingConfig {
                num_train_epochs: 3,
                learning_rate: 1e-5,
                head_learning_rate: 3e-4,
                weight_decay: 0.01,
                adam_beta1: 0.9,
                adam_beta2: 0.98,
                adam_epsilon: 1e-6,
                warmup_steps: 0,
                max_grad_norm: 1.0,
                logging_steps: 500,
                eval_steps: 0,
                seed: 42,
                temperature: 2.0,
                alpha: 0.5,
            },
            head: HeadConfig::default(),
            tracking: TrackingConfig {
                dir: "runs".to_string(),
            },
        }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `COREFKD__`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let d = AppConfig::default();
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("model.cache_dir", d.model.cache_dir)?
        .set_default("device.prefer_gpu", d.device.prefer_gpu)?
        .set_default("device.cuda_device_id", d.device.cuda_device_id as i64)?
        .set_default("data.max_segment_len", d.data.max_segment_len as i64)?
        .set_default("data.max_tokens_in_batch", d.data.max_tokens_in_batch as i64)?
        .set_default("data.eval_split", d.data.eval_split)?
        .set_default("training.num_train_epochs", d.training.num_train_epochs as i64)?
        .set_default("training.learning_rate", d.training.learning_rate)?
        .set_default("training.head_learning_rate", d.training.head_learning_rate)?
        .set_default("training.weight_decay", d.training.weight_decay)?
        .set_default("training.adam_beta1", d.training.adam_beta1)?
        .set_default("training.adam_beta2", d.training.adam_beta2)?
        .set_default("training.adam_epsilon", d.training.adam_epsilon)?
        .set_default("training.warmup_steps", d.training.warmup_steps as i64)?
        .set_default("training.max_grad_norm", d.training.max_grad_norm)?
        .set_default("training.logging_steps", d.training.logging_steps as i64)?
        .set_default("training.eval_steps", d.training.eval_steps as i64)?
        .set_default("training.seed", d.training.seed as i64)?
        .set_default("training.temperature", d.training.temperature)?
        .set_default("training.alpha", d.training.alpha)?
        .set_default("head.ffnn_size", d.head.ffnn_size as i64)?
        .set_default("head.max_span_length", d.head.max_span_length as i64)?
        .set_default("head.top_lambda", d.head.top_lambda)?
        .set_default("head.dropout_prob", d.head.dropout_prob as f64)?
        .set_default("tracking.dir", d.tracking.dir)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (COREFKD__TRAINING__SEED, etc.).  Keys
    // contain underscores, so sections are separated by a double underscore.
    builder = builder.add_source(
        Environment::with_prefix("COREFKD")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand `~` in cache_dir to the actual home directory.
pub fn expand_cache_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn test_default_data_values() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.data.max_segment_len, 512);
        assert_eq!(cfg.data.max_tokens_in_batch, 5000);
        assert_eq!(cfg.data.eval_split, "dev");
    }

    #[test]
    fn test_default_distillation_values() {
        let cfg = load_config(None).unwrap();
        assert!((cfg.training.temperature - 2.0).abs() < f64::EPSILON);
        assert!((cfg.training.alpha - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.training.seed, 42);
    }

    #[test]
    fn test_default_head_matches_core_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.head, HeadConfig::default());
    }

    #[test]
    fn test_default_cache_dir_contains_corefkd() {
        let cfg = load_config(None).unwrap();
        assert!(
            cfg.model.cache_dir.contains("corefkd"),
            "cache_dir should contain 'corefkd', got: {}",
            cfg.model.cache_dir
        );
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[training]\nseed = 7\nalpha = 0.9\n\n[data]\nmax_segment_len = 128\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.training.seed, 7);
        assert!((cfg.training.alpha - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.data.max_segment_len, 128);
        // untouched keys keep their defaults
        assert_eq!(cfg.data.max_tokens_in_batch, 5000);
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here/corefkd.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    // ── expand_cache_dir ──────────────────────────────────────────────────────

    #[test]
    fn test_expand_absolute_path_unchanged() {
        let path = expand_cache_dir("/absolute/path/to/cache");
        assert_eq!(path, PathBuf::from("/absolute/path/to/cache"));
    }

    #[test]
    fn test_expand_tilde_produces_non_tilde_prefix() {
        let path = expand_cache_dir("~/.cache/corefkd");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with(".cache/corefkd"), "got: {s}");
    }

    #[test]
    fn test_expand_relative_path_unchanged() {
        let path = expand_cache_dir("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }
}
