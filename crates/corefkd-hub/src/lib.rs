//! # corefkd-hub
//!
//! Model resolution, Hugging Face downloading and caching for corefkd.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use corefkd_hub::resolve_model;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = dirs::home_dir().unwrap().join(".cache/corefkd");
//!     let dir = resolve_model("biu-nlp/f-coref", &cache, None).await?;
//!     println!("Model ready in {}", dir.display());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod download;
pub mod error;
pub mod integrity;
pub mod resolve;

pub use cache::{FileMetadata, ModelCache};
pub use download::ModelDownloader;
pub use error::{HubError, HubResult};
pub use integrity::verify_cached;
pub use resolve::{resolve_model, ModelRef};
