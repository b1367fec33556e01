//! # corefkd-core
//!
//! Encoder loading, the start-to-end coreference head, tokenization and
//! device abstraction for corefkd.
//!
//! ## Supported Architectures
//!
//! | `model_type` | Role | Encoder |
//! |--------------|------|---------|
//! | `bert` | trainable student | [`bert::BertEncoder`] |
//! | `bert` | frozen teacher | `candle_transformers::models::bert::BertModel` |
//!
//! Any other `model_type` is rejected with
//! [`CoreError::UnsupportedArchitecture`].
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod bert;
pub mod clusters;
pub mod device;
pub mod encoder;
pub mod error;
pub mod head;
pub mod model;
pub mod tokenizer;

pub use clusters::{to_word_clusters, Cluster, Span};
pub use device::{seed_device, select_device, select_device_spec, DeviceSpec};
pub use encoder::{EncoderConfig, SUPPORTED_MODELS};
pub use error::{CoreError, CoreResult};
pub use head::{CorefScores, HeadConfig, MentionSpans};
pub use model::{decode_clusters, CorefModel, EncoderInput, LoadingInfo, ModelRole};
pub use tokenizer::Tokenizer;
