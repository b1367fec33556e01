use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Model not supporting '{model_type}', choose one of {supported:?}")]
    UnsupportedArchitecture {
        model_type: String,
        supported: &'static [&'static str],
    },

    #[error("Checkpoint {path} is missing weights: {reason}")]
    IncompleteCheckpoint { path: String, reason: String },

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
