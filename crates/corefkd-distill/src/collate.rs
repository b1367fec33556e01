//! Turning documents into encoder rows.
//!
//! Both collators cut documents into windows wrapped in `[CLS] … [SEP]` and
//! build a `gather_index` that maps every document token back to its row
//! position, so the model always sees its hidden states in document space
//! regardless of how the rows were laid out.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};

use corefkd_core::{EncoderInput, Tokenizer};

use crate::dataset::Document;

/// Converts a batch of documents into an [`EncoderInput`].
pub trait Collator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn collate(&self, docs: &[&Document], device: &Device) -> Result<EncoderInput>;
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    cls: u32,
    sep: u32,
    pad: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        Self {
            cls: tokenizer.cls_token_id(),
            sep: tokenizer.sep_token_id(),
            pad: tokenizer.pad_token_id(),
        }
    }
}

/// Fixed-size segments: the student's layout.
///
/// Every row is exactly `max_segment_len` long; a document occupies
/// `ceil(len / (max_segment_len - 2))` rows.
#[derive(Debug, Clone)]
pub struct SegmentCollator {
    special: SpecialTokens,
    max_segment_len: usize,
}

impl SegmentCollator {
    pub fn new(tokenizer: &Tokenizer, max_segment_len: usize) -> Self {
        Self { special: SpecialTokens::from_tokenizer(tokenizer), max_segment_len }
    }
}

impl Collator for SegmentCollator {
    fn name(&self) -> &'static str {
        "segment"
    }

    fn collate(&self, docs: &[&Document], device: &Device) -> Result<EncoderInput> {
        ensure!(self.max_segment_len > 2, "max_segment_len must leave room for [CLS] and [SEP]");
        collate_windows(docs, self.special, self.max_segment_len - 2, self.max_segment_len, device)
    }
}

/// Whole documents: the teacher's layout.
///
/// One row per document, padded to the longest document in the batch.
/// Documents beyond the encoder's position limit (`max_len`, special tokens
/// included) continue on extra rows.
#[derive(Debug, Clone)]
pub struct LongDocCollator {
    special: SpecialTokens,
    max_len: usize,
}

impl LongDocCollator {
    pub fn new(tokenizer: &Tokenizer, max_len: usize) -> Self {
        Self { special: SpecialTokens::from_tokenizer(tokenizer), max_len }
    }
}

impl Collator for LongDocCollator {
    fn name(&self) -> &'static str {
        "long-doc"
    }

    fn collate(&self, docs: &[&Document], device: &Device) -> Result<EncoderInput> {
        ensure!(self.max_len > 2, "max_len must leave room for [CLS] and [SEP]");
        let longest = docs.iter().map(|d| d.len()).max().unwrap_or(0);
        let window = longest.min(self.max_len - 2).max(1);
        collate_windows(docs, self.special, window, window + 2, device)
    }
}

/// Lay every document out in windows of `window` tokens, one window per
/// row of length `seq_len`.
fn collate_windows(
    docs: &[&Document],
    special: SpecialTokens,
    window: usize,
    seq_len: usize,
    device: &Device,
) -> Result<EncoderInput> {
    ensure!(!docs.is_empty(), "cannot collate an empty batch");
    ensure!(window + 2 <= seq_len, "window {window} does not fit rows of {seq_len}");

    let doc_lens: Vec<usize> = docs.iter().map(|d| d.len()).collect();
    let max_doc_len = doc_lens.iter().copied().max().unwrap_or(0);

    let mut ids: Vec<u32> = Vec::new();
    let mut mask: Vec<u32> = Vec::new();
    // Padding positions gather row 0, token 0 ([CLS]); they are never read
    // as mentions because proposal stops at each document's length.
    let mut gather = vec![0u32; docs.len() * max_doc_len];
    let mut rows = 0usize;

    for (d, doc) in docs.iter().enumerate() {
        for (w, chunk) in doc.token_ids.chunks(window).enumerate() {
            let row_start = rows * seq_len;
            ids.push(special.cls);
            ids.extend_from_slice(chunk);
            ids.push(special.sep);
            let used = chunk.len() + 2;
            ids.extend(std::iter::repeat(special.pad).take(seq_len - used));
            mask.extend(std::iter::repeat(1u32).take(used));
            mask.extend(std::iter::repeat(0u32).take(seq_len - used));

            for i in 0..chunk.len() {
                let t = w * window + i;
                gather[d * max_doc_len + t] = (row_start + 1 + i) as u32;
            }
            rows += 1;
        }
    }

    Ok(EncoderInput {
        input_ids: Tensor::from_vec(ids, (rows, seq_len), device)?,
        attention_mask: Tensor::from_vec(mask, (rows, seq_len), device)?,
        gather_index: Tensor::from_vec(gather, docs.len() * max_doc_len, device)?,
        doc_lens,
    })
}
