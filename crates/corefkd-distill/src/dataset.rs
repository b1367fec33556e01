//! Coreference dataset loading.
//!
//! Each split is a jsonlines file with one document per line:
//!
//! ```json
//! {"doc_key": "a", "sentences": [["Ann", "said", "she", "left"]], "clusters": [[[0, 0], [2, 2]]]}
//! ```
//!
//! Words may be given as `sentences` (list of sentences) or as a flat
//! `tokens` list.  Cluster spans are inclusive word offsets over the whole
//! document.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use corefkd_core::{Cluster, Tokenizer};

pub const SPLITS: &[&str] = &["train", "dev", "test"];

/// A tokenised document with gold clusters in both offset spaces.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_key: String,
    pub words: Vec<String>,
    /// Subword ids, no special tokens.
    pub token_ids: Vec<u32>,
    /// Word index owning each subword.
    pub subword_to_word: Vec<usize>,
    /// Gold clusters in subword offsets.
    pub clusters: Vec<Cluster>,
    /// Gold clusters in word offsets, as read.
    pub word_clusters: Vec<Cluster>,
}

impl Document {
    /// Length in subwords.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Tokenise `words` and project word-level `clusters` onto subwords.
    ///
    /// A span `(s, e)` becomes (first piece of word `s`, last piece of word `e`).
    pub fn from_words(
        doc_key: String,
        words: Vec<String>,
        word_clusters: Vec<Cluster>,
        tokenizer: &Tokenizer,
    ) -> Result<Self> {
        let mut token_ids = Vec::new();
        let mut subword_to_word = Vec::new();
        let mut word_bounds = Vec::with_capacity(words.len());

        for (w, word) in words.iter().enumerate() {
            let pieces = tokenizer
                .encode_word(word)
                .with_context(|| format!("{doc_key}: cannot tokenise word {w} ({word:?})"))?;
            let first = token_ids.len();
            subword_to_word.extend(std::iter::repeat(w).take(pieces.len()));
            token_ids.extend(pieces);
            word_bounds.push((first, token_ids.len() - 1));
        }

        let mut clusters = Vec::with_capacity(word_clusters.len());
        for cluster in &word_clusters {
            let mut spans = Vec::with_capacity(cluster.len());
            for &(start, end) in cluster {
                if start > end || end >= words.len() {
                    bail!(
                        "{doc_key}: cluster span ({start}, {end}) is outside the document's \
                         {} words",
                        words.len()
                    );
                }
                spans.push((word_bounds[start].0, word_bounds[end].1));
            }
            clusters.push(spans);
        }

        Ok(Self { doc_key, words, token_ids, subword_to_word, clusters, word_clusters })
    }
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    doc_key: Option<String>,
    #[serde(default)]
    sentences: Option<Vec<Vec<String>>>,
    #[serde(default)]
    tokens: Option<Vec<String>>,
    #[serde(default)]
    clusters: Vec<Vec<[usize; 2]>>,
}

/// Load one jsonlines file.  Documents without words are skipped.
pub fn load_file(path: &Path, tokenizer: &Tokenizer) -> Result<Vec<Document>> {
    let file = fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

    let mut docs = Vec::new();
    for (line_no, line) in io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("IO error reading {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let location = || format!("{}:{}", path.display(), line_no + 1);
        let raw: RawDocument = serde_json::from_str(trimmed).with_context(|| {
            format!("JSON parse error at {} (expected doc_key/sentences/clusters)", location())
        })?;

        let words: Vec<String> = match (raw.sentences, raw.tokens) {
            (Some(sentences), _) => sentences.into_iter().flatten().collect(),
            (None, Some(tokens)) => tokens,
            (None, None) => bail!("{}: document has neither `sentences` nor `tokens`", location()),
        };
        let doc_key = raw.doc_key.unwrap_or_else(|| format!("{stem}:{}", line_no + 1));
        if words.is_empty() {
            warn!(doc_key, "Skipping empty document");
            continue;
        }

        let clusters = raw
            .clusters
            .into_iter()
            .map(|c| c.into_iter().map(|[s, e]| (s, e)).collect())
            .collect();
        let doc = Document::from_words(doc_key, words, clusters, tokenizer).with_context(location)?;
        docs.push(doc);
    }

    let subwords: usize = docs.iter().map(Document::len).sum();
    info!(path = %path.display(), docs = docs.len(), subwords, "Loaded dataset file");
    Ok(docs)
}

/// Split name → documents.
pub type SplitMap = BTreeMap<String, Vec<Document>>;

/// Split name → source file.
pub type DatasetFiles = BTreeMap<String, PathBuf>;

/// Load every split whose file is given.
pub fn create(
    tokenizer: &Tokenizer,
    train_file: Option<&Path>,
    dev_file: Option<&Path>,
    test_file: Option<&Path>,
) -> Result<(SplitMap, DatasetFiles)> {
    let mut dataset = SplitMap::new();
    let mut files = DatasetFiles::new();
    for (split, file) in SPLITS.iter().zip([train_file, dev_file, test_file]) {
        if let Some(path) = file {
            let docs = load_file(path, tokenizer)
                .with_context(|| format!("Failed to load {split} split"))?;
            dataset.insert(split.to_string(), docs);
            files.insert(split.to_string(), path.to_path_buf());
        }
    }
    Ok((dataset, files))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub const VOCAB: &[&str] = &[
        "john", "said", "he", "left", "mary", "saw", "her", "and", "smiled", ".",
    ];

    /// Write a whitespace word-level `tokenizer.json` covering [`VOCAB`].
    pub fn write_tokenizer(dir: &Path) -> PathBuf {
        let mut vocab = serde_json::Map::new();
        let specials = ["[PAD]", "[UNK]", "[CLS]", "[SEP]"];
        for (i, tok) in specials.iter().chain(VOCAB.iter()).enumerate() {
            vocab.insert(tok.to_string(), serde_json::json!(i));
        }
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
        });
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        path
    }

    pub fn vocab_size() -> usize {
        VOCAB.len() + 4
    }

    /// A small jsonlines split with documents of varying length.
    pub fn write_split(dir: &Path, name: &str) -> PathBuf {
        let lines = [
            concat!(
                r#"{"doc_key": "a", "sentences": [["john", "said", "he", "left", "."]], "#,
                r#""clusters": [[[0, 0], [2, 2]]]}"#,
            ),
            concat!(
                r#"{"doc_key": "b", "tokens": ["mary", "saw", "her", "and", "smiled", "."], "#,
                r#""clusters": [[[0, 0], [2, 2]]]}"#,
            ),
            concat!(
                r#"{"doc_key": "c", "sentences": [["john", "saw", "mary", "."], "#,
                r#"["he", "smiled", "and", "she", "left", "."]], "#,
                r#""clusters": [[[0, 0], [4, 4]], [[2, 2], [7, 7]]]}"#,
            ),
            r#"{"doc_key": "d", "sentences": [["mary", "left", "."]], "clusters": []}"#,
        ];
        let path = dir.join(format!("{name}.jsonl"));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }
}
