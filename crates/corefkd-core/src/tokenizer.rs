use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Thin wrapper around the Hugging Face `tokenizers` crate.
///
/// Coreference documents arrive pre-split into words, so the main entry point
/// is [`Tokenizer::encode_word`]: each word is encoded on its own, without
/// special tokens, which keeps the word → subword alignment exact.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    cls_token_id: u32,
    sep_token_id: u32,
    pad_token_id: u32,
    unk_token_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(format!("{}: {e}", path.display())))?;

        let lookup = |candidates: &[&str], what: &str| -> CoreResult<u32> {
            Self::special_token_id(&inner, candidates).ok_or_else(|| {
                CoreError::Tokenizer(format!(
                    "{} has no {what} token (looked for {candidates:?})",
                    path.display()
                ))
            })
        };

        let cls_token_id = lookup(&["[CLS]", "<s>"], "classification")?;
        let sep_token_id = lookup(&["[SEP]", "</s>"], "separator")?;
        let pad_token_id = lookup(&["[PAD]", "<pad>"], "padding")?;
        let unk_token_id = lookup(&["[UNK]", "<unk>"], "unknown")?;

        debug!(
            cls_token_id,
            sep_token_id,
            pad_token_id,
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded from file"
        );

        Ok(Self { inner, cls_token_id, sep_token_id, pad_token_id, unk_token_id })
    }

    /// Encode a text string to a sequence of token ids.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a single word into its subword pieces.
    ///
    /// Never returns an empty vector: words the vocabulary cannot represent at
    /// all (e.g. stray control characters) become the unknown token so every
    /// word owns at least one subword.
    pub fn encode_word(&self, word: &str) -> CoreResult<Vec<u32>> {
        let ids = self.encode(word, false)?;
        if ids.is_empty() {
            Ok(vec![self.unk_token_id])
        } else {
            Ok(ids)
        }
    }

    pub fn cls_token_id(&self) -> u32 {
        self.cls_token_id
    }

    pub fn sep_token_id(&self) -> u32 {
        self.sep_token_id
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// The size of the model vocabulary, including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
        let vocab = tokenizer.get_vocab(true);
        for candidate in candidates {
            if let Some(&id) = vocab.get(*candidate) {
                return Some(id);
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::write_word_level_tokenizer;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_special_token_ids() {
        let dir = TempDir::new().unwrap();
        let path = write_word_level_tokenizer(dir.path(), &["john", "said"]);
        let tok = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tok.pad_token_id(), 0);
        assert_eq!(tok.cls_token_id(), 2);
        assert_eq!(tok.sep_token_id(), 3);
        assert_eq!(tok.vocab_size(), 6);
    }

    #[test]
    fn unknown_word_maps_to_unk() {
        let dir = TempDir::new().unwrap();
        let path = write_word_level_tokenizer(dir.path(), &["john"]);
        let tok = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tok.encode_word("john").unwrap(), vec![4]);
        assert_eq!(tok.encode_word("mary").unwrap(), vec![1]);
    }

    #[test]
    fn missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let result = Tokenizer::from_file(&dir.path().join("tokenizer.json"));
        assert!(matches!(result, Err(CoreError::Tokenizer(_))));
    }
}
