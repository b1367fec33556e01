//! Shared test fixtures: a tiny random BERT coreference model.

use std::path::Path;

use candle_core::Device;

use corefkd_core::{CorefModel, EncoderConfig, HeadConfig};

use crate::dataset::test_support::{vocab_size, write_tokenizer};

pub fn tiny_head_config() -> HeadConfig {
    HeadConfig { ffnn_size: 8, max_span_length: 3, top_lambda: 0.5, dropout_prob: 0.0 }
}

pub fn tiny_encoder_config(hidden_size: usize) -> EncoderConfig {
    let json = serde_json::json!({
        "model_type": "bert",
        "vocab_size": vocab_size(),
        "hidden_size": hidden_size,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": hidden_size * 2,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.0,
        "attention_probs_dropout_prob": 0.0,
        "max_position_embeddings": 64,
        "type_vocab_size": 2,
        "initializer_range": 0.02,
        "layer_norm_eps": 1e-12,
        "pad_token_id": 0,
        "position_embedding_type": "absolute",
        "use_cache": false,
        "classifier_dropout": null
    });
    EncoderConfig::from_json(&json.to_string()).unwrap()
}

/// Save a random model plus tokenizer into `dir` and return it.
pub fn write_tiny_model(dir: &Path, hidden_size: usize) -> CorefModel {
    std::fs::create_dir_all(dir).unwrap();
    let tokenizer = write_tokenizer(dir);
    let model = CorefModel::init(
        tiny_encoder_config(hidden_size),
        tiny_head_config(),
        0,
        &Device::Cpu,
    )
    .unwrap();
    model.save(dir, None).unwrap();
    assert!(tokenizer.exists());
    model
}
