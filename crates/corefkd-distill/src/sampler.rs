//! Token-budgeted batching.
//!
//! Documents are sorted by length and packed greedily so the padded segment
//! cost of a batch stays within `max_tokens`.  The plan depends only on the
//! documents and the numeric limits, never on the collator, so a student and
//! a teacher sampler over the same split agree batch for batch.

use std::fmt;

use anyhow::Result;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use corefkd_core::EncoderInput;

use crate::collate::Collator;
use crate::dataset::Document;

/// Maximum document length (subwords) used when building training batches.
pub const TRAIN_MAX_DOC_LEN: usize = 4096;

/// Indices of the documents making up one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub doc_indices: Vec<usize>,
    /// Padded segment cost of the batch.
    pub cost: usize,
}

pub struct DynamicBatchSampler<'a> {
    docs: &'a [Document],
    collator: &'a dyn Collator,
    max_tokens: usize,
    max_segment_len: usize,
    max_doc_len: Option<usize>,
}

impl<'a> DynamicBatchSampler<'a> {
    pub fn new(
        docs: &'a [Document],
        collator: &'a dyn Collator,
        max_tokens: usize,
        max_segment_len: usize,
    ) -> Self {
        Self {
            docs,
            collator,
            max_tokens,
            max_segment_len,
            max_doc_len: None,
        }
    }

    /// Skip documents longer than `max_doc_len` subwords.
    pub fn with_max_doc_len(mut self, max_doc_len: usize) -> Self {
        self.max_doc_len = Some(max_doc_len);
        self
    }

    /// Padded cost of a document: whole segments of `max_segment_len`.
    pub fn doc_cost(&self, len: usize) -> usize {
        let window = self.max_segment_len.saturating_sub(2).max(1);
        len.div_ceil(window) * self.max_segment_len
    }

    /// Group documents into batches (sorted by length, unshuffled).
    pub fn plan(&self) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.docs.len()).collect();
        order.sort_by_key(|&i| (self.docs[i].len(), i));

        let mut skipped = 0usize;
        let mut batches = Vec::new();
        let mut current = Batch { doc_indices: Vec::new(), cost: 0 };

        for i in order {
            let len = self.docs[i].len();
            if self.max_doc_len.is_some_and(|max| len > max) {
                skipped += 1;
                continue;
            }
            let cost = self.doc_cost(len);
            if !current.doc_indices.is_empty() && current.cost + cost > self.max_tokens {
                let empty = Batch {
                    doc_indices: Vec::new(),
                    cost: 0,
                };
                batches.push(std::mem::replace(&mut current, empty));
            }
            if current.doc_indices.is_empty() && cost > self.max_tokens {
                warn!(
                    doc_key = %self.docs[i].doc_key,
                    cost,
                    max_tokens = self.max_tokens,
                    "Document exceeds the token budget on its own; batching it alone"
                );
            }
            current.doc_indices.push(i);
            current.cost += cost;
        }
        if !current.doc_indices.is_empty() {
            batches.push(current);
        }

        if skipped > 0 {
            info!(skipped, max_doc_len = ?self.max_doc_len, "Skipped over-long documents");
        }
        batches
    }
}

/// A materialised batch plan bound to its documents and collator.
#[derive(Clone)]
pub struct Batches<'a> {
    docs: &'a [Document],
    collator: &'a dyn Collator,
    batches: Vec<Batch>,
}

/// Plan every batch of `sampler`.
pub fn create_batches<'a>(sampler: &DynamicBatchSampler<'a>) -> Batches<'a> {
    Batches { docs: sampler.docs, collator: sampler.collator, batches: sampler.plan() }
}

impl<'a> Batches<'a> {
    /// Permute batch order deterministically.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.batches.shuffle(&mut rng);
        self
    }

    /// A copy of the plan with a fresh deterministic order.
    pub fn reshuffled(&self, seed: u64) -> Self {
        Batches {
            docs: self.docs,
            collator: self.collator,
            batches: self.batches.clone(),
        }
        .shuffle(seed)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn num_docs(&self) -> usize {
        self.batches.iter().map(|b| b.doc_indices.len()).sum()
    }

    pub fn num_tokens(&self) -> usize {
        self.batches.iter().flat_map(|b| &b.doc_indices).map(|&i| self.docs[i].len()).sum()
    }

    pub fn documents(&self, batch: &Batch) -> Vec<&'a Document> {
        batch.doc_indices.iter().map(|&i| &self.docs[i]).collect()
    }

    pub fn doc_keys(&self, batch: &Batch) -> Vec<&'a str> {
        batch.doc_indices.iter().map(|&i| self.docs[i].doc_key.as_str()).collect()
    }

    pub fn collate(&self, batch: &Batch, device: &Device) -> Result<EncoderInput> {
        self.collator.collate(&self.documents(batch), device)
    }
}

impl fmt::Display for Batches<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_docs = self.batches.iter().map(|b| b.doc_indices.len()).max().unwrap_or(0);
        write!(
            f,
            "{} batches ({} collator): {} documents, {} subwords, at most {} documents per batch",
            self.len(),
            self.collator.name(),
            self.num_docs(),
            self.num_tokens(),
            max_docs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::{LongDocCollator, SegmentCollator};
    use crate::dataset::test_support::write_tokenizer;
    use corefkd_core::Tokenizer;
    use tempfile::TempDir;

    fn docs(lens: &[usize]) -> Vec<Document> {
        lens.iter()
            .enumerate()
            .map(|(i, &len)| Document {
                doc_key: format!("d{i}"),
                words: vec!["w".to_string(); len],
                token_ids: vec![5; len],
                subword_to_word: (0..len).collect(),
                clusters: vec![],
                word_clusters: vec![],
            })
            .collect()
    }

    fn tokenizer() -> (Tokenizer, TempDir) {
        let dir = TempDir::new().unwrap();
        (Tokenizer::from_file(&write_tokenizer(dir.path())).unwrap(), dir)
    }

    #[test]
    fn cost_counts_whole_segments() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&[1]);
        let sampler = DynamicBatchSampler::new(&d, &collator, 100, 10);
        assert_eq!(sampler.doc_cost(1), 10);
        assert_eq!(sampler.doc_cost(8), 10);
        assert_eq!(sampler.doc_cost(9), 20);
    }

    #[test]
    fn batches_respect_token_budget() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&[3, 20, 7, 8, 1, 15, 4, 30]);
        let sampler = DynamicBatchSampler::new(&d, &collator, 30, 10);
        let plan = sampler.plan();
        let mut seen: Vec<usize> = plan.iter().flat_map(|b| b.doc_indices.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>(), "every document planned once");
        for batch in &plan {
            assert!(batch.cost <= 30 || batch.doc_indices.len() == 1, "{batch:?}");
        }
    }

    #[test]
    fn oversized_document_is_batched_alone() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&[2, 50]);
        let plan = DynamicBatchSampler::new(&d, &collator, 20, 10).plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].doc_indices, vec![1]);
    }

    #[test]
    fn long_documents_are_skipped() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&[5, 500, 6]);
        let sampler = DynamicBatchSampler::new(&d, &collator, 1000, 10).with_max_doc_len(100);
        let batches = create_batches(&sampler);
        assert_eq!(batches.num_docs(), 2);
        assert_eq!(batches.num_tokens(), 11);
    }

    #[test]
    fn student_and_teacher_plans_match() {
        let (tok, _dir) = tokenizer();
        let student = SegmentCollator::new(&tok, 10);
        let teacher = LongDocCollator::new(&tok, 512);
        let d = docs(&[3, 20, 7, 8, 1, 15, 4, 30, 12]);
        let s = create_batches(&DynamicBatchSampler::new(&d, &student, 40, 10)).shuffle(7);
        let t = create_batches(&DynamicBatchSampler::new(&d, &teacher, 40, 10)).shuffle(7);
        assert_eq!(s.batches(), t.batches());
    }

    #[test]
    fn shuffle_is_seed_deterministic() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&(1..40).collect::<Vec<_>>());
        let sampler = DynamicBatchSampler::new(&d, &collator, 20, 10);
        let a = create_batches(&sampler).shuffle(1);
        let b = create_batches(&sampler).shuffle(1);
        let c = a.reshuffled(2);
        assert_eq!(a.batches(), b.batches());
        assert_ne!(a.batches(), c.batches());
    }

    #[test]
    fn display_summarises_plan() {
        let (tok, _dir) = tokenizer();
        let collator = SegmentCollator::new(&tok, 10);
        let d = docs(&[3, 4]);
        let text = create_batches(&DynamicBatchSampler::new(&d, &collator, 100, 10)).to_string();
        assert!(
            text.starts_with("1 batches (segment collator): 2 documents, 7 subwords"),
            "{text}"
        );
    }
}
