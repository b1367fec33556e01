//! Transformer encoder backbone.
//!
//! Reads the Hugging Face `config.json`, enforces the supported-architecture
//! list, and runs the encoder over a padded `[rows, seq_len]` batch.  Frozen
//! encoders use the fused `candle-transformers` BERT; trainable ones use
//! [`crate::bert::BertEncoder`], which keeps the autograd graph intact.

use std::path::Path;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;

use crate::bert::{BertEncoder, BertParams};
use crate::error::{CoreError, CoreResult};

/// Base-model families the coreference model can be built on.
pub const SUPPORTED_MODELS: &[&str] = &["bert"];

/// The subset of `config.json` needed before the encoder is built.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub model_type: String,
    pub hidden_size: usize,
    pub max_position_embeddings: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    /// Standard deviation of freshly initialised weights.
    pub initializer_range: f64,
    /// The full document, kept so it can be re-emitted next to saved weights.
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
struct ConfigHeader {
    #[serde(default)]
    model_type: Option<String>,
    hidden_size: usize,
    max_position_embeddings: usize,
    vocab_size: usize,
    num_hidden_layers: usize,
    #[serde(default = "default_initializer_range")]
    initializer_range: f64,
}

fn default_initializer_range() -> f64 {
    0.02
}

impl EncoderConfig {
    /// Read `<model_dir>/config.json`.
    pub fn from_model_dir(model_dir: &Path) -> CoreResult<Self> {
        let path = model_dir.join("config.json");
        let json = std::fs::read_to_string(&path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let header: ConfigHeader = serde_json::from_value(raw.clone())?;
        let model_type = header.model_type.ok_or_else(|| CoreError::Config {
            field: "model_type".to_string(),
            reason: "config.json does not declare a model_type".to_string(),
        })?;
        Ok(Self {
            model_type,
            hidden_size: header.hidden_size,
            max_position_embeddings: header.max_position_embeddings,
            vocab_size: header.vocab_size,
            num_hidden_layers: header.num_hidden_layers,
            initializer_range: header.initializer_range,
            raw,
        })
    }

    /// Fail unless `model_type` names a supported encoder family.
    pub fn ensure_supported(&self) -> CoreResult<()> {
        if SUPPORTED_MODELS.contains(&self.model_type.as_str()) {
            Ok(())
        } else {
            Err(CoreError::UnsupportedArchitecture {
                model_type: self.model_type.clone(),
                supported: SUPPORTED_MODELS,
            })
        }
    }

    /// Longest row (including `[CLS]`/`[SEP]`) the encoder accepts.
    pub fn max_sequence_length(&self) -> usize {
        self.max_position_embeddings
    }
}

/// A loaded encoder.
pub enum Encoder {
    /// Differentiable BERT, for weights that train.
    Bert(BertEncoder),
    /// Fused inference-only BERT.
    FusedBert(BertModel),
}

impl Encoder {
    /// Build the encoder described by `config` from `vb`.
    pub fn load(vb: VarBuilder, config: &EncoderConfig, trainable: bool) -> CoreResult<Self> {
        config.ensure_supported()?;
        match config.model_type.as_str() {
            "bert" if trainable => {
                let params: BertParams = serde_json::from_value(config.raw.clone())?;
                Ok(Self::Bert(BertEncoder::load(vb, &params)?))
            }
            "bert" => {
                let bert_config: BertConfig = serde_json::from_value(config.raw.clone())?;
                Ok(Self::FusedBert(BertModel::load(vb, &bert_config)?))
            }
            other => Err(CoreError::UnsupportedArchitecture {
                model_type: other.to_string(),
                supported: SUPPORTED_MODELS,
            }),
        }
    }

    /// Run the encoder.
    ///
    /// `input_ids` and `attention_mask` are `[rows, seq_len]` u32 tensors; the
    /// result is `[rows, seq_len, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> CoreResult<Tensor> {
        match self {
            Self::Bert(model) => model.forward(input_ids, attention_mask),
            Self::FusedBert(model) => {
                let token_type_ids = input_ids.zeros_like()?;
                Ok(model.forward(input_ids, &token_type_ids, Some(attention_mask))?)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::tiny_bert_config;
    use super::*;

    #[test]
    fn parses_bert_config() {
        let cfg = EncoderConfig::from_json(&tiny_bert_config(10, 8).to_string()).unwrap();
        assert_eq!(cfg.model_type, "bert");
        assert_eq!(cfg.hidden_size, 8);
        assert_eq!(cfg.max_sequence_length(), 64);
        assert!((cfg.initializer_range - 0.02).abs() < 1e-12);
        assert!(cfg.ensure_supported().is_ok());
    }

    #[test]
    fn unsupported_model_type_is_rejected() {
        let mut raw = tiny_bert_config(10, 8);
        raw["model_type"] = serde_json::json!("gpt2");
        let cfg = EncoderConfig::from_json(&raw.to_string()).unwrap();
        let err = cfg.ensure_supported().unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedArchitecture { .. }));
        assert!(err.to_string().contains("gpt2"));
    }

    #[test]
    fn missing_model_type_is_a_config_error() {
        let mut raw = tiny_bert_config(10, 8);
        raw.as_object_mut().unwrap().remove("model_type");
        let err = EncoderConfig::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }
}
