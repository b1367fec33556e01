//! Start-to-end coreference head.
//!
//! Mentions are scored from their boundary tokens only (no span pooling), and
//! antecedents from four bilinear interactions between the boundary
//! representations of two mentions.  Every score is computed with plain
//! `candle` tensor ops so gradients flow back into the encoder.

use std::sync::Mutex;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Additive score for pairs that must never be selected.
pub const MASKED_SCORE: f32 = -1e4;

/// Hyper-parameters of the coreference head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Width of every boundary FFNN.
    pub ffnn_size: usize,
    /// Longest span (in subwords) considered as a mention.
    pub max_span_length: usize,
    /// Mentions kept per document, as a fraction of its subword length.
    pub top_lambda: f64,
    pub dropout_prob: f32,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            ffnn_size: 1024,
            max_span_length: 30,
            top_lambda: 0.4,
            dropout_prob: 0.3,
        }
    }
}

/// Candidate mentions selected for a batch, padded to a common `k`.
///
/// Offsets are subword positions inside each document.  Entries at index
/// `>= num_valid[b]` are padding and always masked.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionSpans {
    pub starts: Vec<Vec<usize>>,
    pub ends: Vec<Vec<usize>>,
    pub num_valid: Vec<usize>,
    pub k: usize,
}

impl MentionSpans {
    pub fn num_docs(&self) -> usize {
        self.starts.len()
    }

    pub fn is_valid(&self, doc: usize, mention: usize) -> bool {
        mention < self.num_valid[doc]
    }

    /// `1.0` for real mentions, `0.0` for padding, shape `[docs * k]`.
    pub fn validity(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_docs() * self.k);
        for &n in &self.num_valid {
            out.extend((0..self.k).map(|i| if i < n { 1.0 } else { 0.0 }));
        }
        out
    }

    /// Build padded spans from per-document `(start, end)` lists.
    pub fn from_lists(lists: &[Vec<(usize, usize)>]) -> Self {
        let k = lists.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut starts = Vec::with_capacity(lists.len());
        let mut ends = Vec::with_capacity(lists.len());
        let mut num_valid = Vec::with_capacity(lists.len());
        for spans in lists {
            let mut s: Vec<usize> = spans.iter().map(|&(a, _)| a).collect();
            let mut e: Vec<usize> = spans.iter().map(|&(_, b)| b).collect();
            num_valid.push(spans.len());
            s.resize(k, 0);
            e.resize(k, 0);
            starts.push(s);
            ends.push(e);
        }
        Self { starts, ends, num_valid, k }
    }
}

/// Head outputs for one batch.
#[derive(Debug, Clone)]
pub struct CorefScores {
    /// `[docs, k]`
    pub mention_logits: Tensor,
    /// `[docs, k, k + 1]`; the last column is the null antecedent.
    pub coref_logits: Tensor,
}

impl CorefScores {
    /// Cut both tensors from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            mention_logits: self.mention_logits.detach(),
            coref_logits: self.coref_logits.detach(),
        }
    }
}

struct MentionReps {
    /// Start representations after the bilinear start→end map, `[B, T, F]`.
    start_proj: Tensor,
    end: Tensor,
    start_score: Tensor,
    end_score: Tensor,
}

/// Inverted dropout drawing its masks from a seeded host RNG, so a fixed seed
/// reproduces training on every backend.
struct SeededDropout {
    prob: f32,
    rng: Mutex<StdRng>,
}

impl SeededDropout {
    fn new(prob: f32, seed: u64) -> Self {
        Self {
            prob,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn forward(&self, xs: &Tensor, train: bool) -> CoreResult<Tensor> {
        if !train || self.prob <= 0.0 {
            return Ok(xs.clone());
        }
        let keep = 1.0 - self.prob;
        let mask: Vec<f32> = {
            let mut rng = self.rng.lock().map_err(|_| CoreError::Config {
                field: "dropout".to_string(),
                reason: "dropout RNG lock poisoned".to_string(),
            })?;
            (0..xs.elem_count())
                .map(|_| {
                    if rng.gen::<f32>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                })
                .collect()
        };
        let mask = Tensor::from_vec(mask, xs.shape(), xs.device())?.to_dtype(xs.dtype())?;
        Ok(xs.mul(&mask)?)
    }
}

pub struct CorefHead {
    config: HeadConfig,
    mention_start: Linear,
    mention_end: Linear,
    mention_bilinear: Linear,
    start_scorer: Linear,
    end_scorer: Linear,
    coref_start: Linear,
    coref_end: Linear,
    start_start: Linear,
    end_end: Linear,
    start_end: Linear,
    end_start: Linear,
    dropout: SeededDropout,
}

impl CorefHead {
    /// `seed` drives the dropout masks drawn while training.
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        config: &HeadConfig,
        seed: u64,
    ) -> CoreResult<Self> {
        let f = config.ffnn_size;
        Ok(Self {
            config: config.clone(),
            mention_start: linear(hidden_size, f, vb.pp("mention_start"))?,
            mention_end: linear(hidden_size, f, vb.pp("mention_end"))?,
            mention_bilinear: linear_no_bias(f, f, vb.pp("mention_bilinear"))?,
            start_scorer: linear(f, 1, vb.pp("start_scorer"))?,
            end_scorer: linear(f, 1, vb.pp("end_scorer"))?,
            coref_start: linear(hidden_size, f, vb.pp("coref_start"))?,
            coref_end: linear(hidden_size, f, vb.pp("coref_end"))?,
            start_start: linear_no_bias(f, f, vb.pp("start_start"))?,
            end_end: linear_no_bias(f, f, vb.pp("end_end"))?,
            start_end: linear_no_bias(f, f, vb.pp("start_end"))?,
            end_start: linear_no_bias(f, f, vb.pp("end_start"))?,
            dropout: SeededDropout::new(config.dropout_prob, seed),
        })
    }

    fn ffnn(&self, layer: &Linear, hidden: &Tensor, train: bool) -> CoreResult<Tensor> {
        let x = layer.forward(hidden)?.relu()?;
        self.dropout.forward(&x, train)
    }

    fn mention_reps(&self, hidden: &Tensor, train: bool) -> CoreResult<MentionReps> {
        let start = self.ffnn(&self.mention_start, hidden, train)?;
        let end = self.ffnn(&self.mention_end, hidden, train)?;
        let start_score = self.start_scorer.forward(&start)?.squeeze(D::Minus1)?;
        let end_score = self.end_scorer.forward(&end)?.squeeze(D::Minus1)?;
        let start_proj = self.mention_bilinear.forward(&start)?;
        Ok(MentionReps { start_proj, end, start_score, end_score })
    }

    /// Select the top-scoring candidate spans of every document.
    ///
    /// Scores are read back to the host; selection is not differentiable.
    /// Spans are ordered by `(start, end)` inside each document.
    pub fn propose(&self, hidden: &Tensor, doc_lens: &[usize]) -> CoreResult<MentionSpans> {
        let (batch, max_len, _) = hidden.dims3()?;
        let reps = self.mention_reps(hidden, false)?;

        let mut candidates: Vec<Vec<(f32, usize, usize)>> = vec![Vec::new(); batch];
        for width in 0..self.config.max_span_length.min(max_len) {
            let len = max_len - width;
            let bilinear = reps
                .start_proj
                .narrow(1, 0, len)?
                .mul(&reps.end.narrow(1, width, len)?)?
                .sum(D::Minus1)?;
            let scores = bilinear
                .add(&reps.start_score.narrow(1, 0, len)?)?
                .add(&reps.end_score.narrow(1, width, len)?)?
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?;
            for (doc, row) in scores.iter().enumerate() {
                let doc_len = doc_lens[doc];
                for (start, &score) in row.iter().enumerate() {
                    let end = start + width;
                    if end < doc_len {
                        candidates[doc].push((score, start, end));
                    }
                }
            }
        }

        let lists: Vec<Vec<(usize, usize)>> = candidates
            .into_iter()
            .zip(doc_lens)
            .map(|(mut cands, &len)| {
                let keep = ((self.config.top_lambda * len as f64).ceil() as usize).min(cands.len());
                cands.sort_by(|a, b| b.0.total_cmp(&a.0));
                let mut kept: Vec<(usize, usize)> =
                    cands.into_iter().take(keep).map(|(_, s, e)| (s, e)).collect();
                kept.sort_unstable();
                kept
            })
            .collect();

        Ok(MentionSpans::from_lists(&lists))
    }

    /// Score `spans` as mentions and every earlier span as their antecedent.
    pub fn score(
        &self,
        hidden: &Tensor,
        spans: &MentionSpans,
        train: bool,
    ) -> CoreResult<CorefScores> {
        let (batch, max_len, _) = hidden.dims3()?;
        let device = hidden.device();
        let k = spans.k;
        let f = self.config.ffnn_size;

        let (start_idx, end_idx) = flat_span_indices(spans, max_len, device)?;
        let reps = self.mention_reps(hidden, train)?;

        let gather = |t: &Tensor, idx: &Tensor| -> CoreResult<Tensor> {
            Ok(t.reshape((batch * max_len, f))?.index_select(idx, 0)?)
        };
        let gather_scalar = |t: &Tensor, idx: &Tensor| -> CoreResult<Tensor> {
            Ok(t.reshape(batch * max_len)?.index_select(idx, 0)?)
        };

        let mention_logits = gather(&reps.start_proj, &start_idx)?
            .mul(&gather(&reps.end, &end_idx)?)?
            .sum(D::Minus1)?
            .add(&gather_scalar(&reps.start_score, &start_idx)?)?
            .add(&gather_scalar(&reps.end_score, &end_idx)?)?
            .reshape((batch, k))?;

        let cs = gather(&self.ffnn(&self.coref_start, hidden, train)?, &start_idx)?
            .reshape((batch, k, f))?;
        let ce = gather(&self.ffnn(&self.coref_end, hidden, train)?, &end_idx)?
            .reshape((batch, k, f))?;

        let pair = bilinear(&self.start_start, &cs, &cs)?
            .add(&bilinear(&self.end_end, &ce, &ce)?)?
            .add(&bilinear(&self.start_end, &cs, &ce)?)?
            .add(&bilinear(&self.end_start, &ce, &cs)?)?
            .broadcast_add(&mention_logits.unsqueeze(2)?)?
            .broadcast_add(&mention_logits.unsqueeze(1)?)?;

        let mask = Tensor::from_vec(antecedent_mask(spans), (batch, k, k), device)?
            .to_dtype(pair.dtype())?;
        let pair = pair.add(&mask)?;
        let null = Tensor::zeros((batch, k, 1), pair.dtype(), device)?;
        let coref_logits = Tensor::cat(&[&pair, &null], 2)?;

        Ok(CorefScores { mention_logits, coref_logits })
    }
}

/// `w(x) · yᵀ` for `[B, K, F]` inputs, giving `[B, K, K]`.
fn bilinear(w: &Linear, x: &Tensor, y: &Tensor) -> CoreResult<Tensor> {
    let yt = y.transpose(1, 2)?.contiguous()?;
    Ok(w.forward(x)?.matmul(&yt)?)
}

fn flat_span_indices(
    spans: &MentionSpans,
    max_len: usize,
    device: &Device,
) -> CoreResult<(Tensor, Tensor)> {
    let n = spans.num_docs() * spans.k;
    let mut starts = Vec::with_capacity(n);
    let mut ends = Vec::with_capacity(n);
    for doc in 0..spans.num_docs() {
        let base = doc * max_len;
        for i in 0..spans.k {
            starts.push((base + spans.starts[doc][i]) as u32);
            ends.push((base + spans.ends[doc][i]) as u32);
        }
    }
    Ok((Tensor::from_vec(starts, n, device)?, Tensor::from_vec(ends, n, device)?))
}

/// Additive mask over `[docs, k, k]`: `0` where mention `j` may be the
/// antecedent of mention `i` (`j < i`, both real), [`MASKED_SCORE`] elsewhere.
pub fn antecedent_mask(spans: &MentionSpans) -> Vec<f32> {
    let k = spans.k;
    let mut mask = Vec::with_capacity(spans.num_docs() * k * k);
    for doc in 0..spans.num_docs() {
        let valid = spans.num_valid[doc];
        for i in 0..k {
            for j in 0..k {
                let allowed = j < i && i < valid;
                mask.push(if allowed { 0.0 } else { MASKED_SCORE });
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn head(max_span_length: usize, top_lambda: f64) -> (CorefHead, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = HeadConfig { ffnn_size: 8, max_span_length, top_lambda, dropout_prob: 0.0 };
        (CorefHead::new(vb, 6, &cfg, 0).unwrap(), varmap)
    }

    #[test]
    fn from_lists_pads_to_longest() {
        let spans = MentionSpans::from_lists(&[vec![(0, 1), (2, 2)], vec![(1, 1)]]);
        assert_eq!(spans.k, 2);
        assert_eq!(spans.num_valid, vec![2, 1]);
        assert_eq!(spans.starts[1], vec![1, 0]);
        assert_eq!(spans.validity(), vec![1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn from_lists_never_produces_empty_k() {
        let spans = MentionSpans::from_lists(&[vec![]]);
        assert_eq!(spans.k, 1);
        assert!(!spans.is_valid(0, 0));
    }

    #[test]
    fn antecedent_mask_only_allows_earlier_real_mentions() {
        let spans = MentionSpans::from_lists(&[vec![(0, 0), (1, 1), (2, 2)], vec![(0, 0)]]);
        let mask = antecedent_mask(&spans);
        let at = |d: usize, i: usize, j: usize| mask[d * 9 + i * 3 + j];
        assert_eq!(at(0, 2, 0), 0.0);
        assert_eq!(at(0, 2, 1), 0.0);
        assert_eq!(at(0, 1, 1), MASKED_SCORE);
        assert_eq!(at(0, 0, 2), MASKED_SCORE);
        // doc 1 has a single real mention; its padding rows stay masked
        assert_eq!(at(1, 1, 0), MASKED_SCORE);
    }

    #[test]
    fn propose_respects_document_length_and_width() {
        let (head, _vm) = head(2, 1.0);
        let hidden = Tensor::randn(0f32, 1f32, (2, 5, 6), &Device::Cpu).unwrap();
        let spans = head.propose(&hidden, &[5, 3]).unwrap();
        for doc in 0..2 {
            let len = [5, 3][doc];
            for i in 0..spans.num_valid[doc] {
                let (s, e) = (spans.starts[doc][i], spans.ends[doc][i]);
                assert!(s <= e && e < len, "span ({s},{e}) outside doc of len {len}");
                assert!(e - s < 2, "span ({s},{e}) wider than max_span_length");
            }
        }
        // top_lambda = 1.0 keeps `len` spans when enough candidates exist
        assert_eq!(spans.num_valid, vec![5, 3]);
    }

    #[test]
    fn proposed_spans_are_sorted() {
        let (head, _vm) = head(3, 0.8);
        let hidden = Tensor::randn(0f32, 1f32, (1, 7, 6), &Device::Cpu).unwrap();
        let spans = head.propose(&hidden, &[7]).unwrap();
        let pairs: Vec<_> = (0..spans.num_valid[0])
            .map(|i| (spans.starts[0][i], spans.ends[0][i]))
            .collect();
        let mut sorted = pairs.clone();
        sorted.sort_unstable();
        assert_eq!(pairs, sorted);
    }

    #[test]
    fn score_shapes_and_null_column() {
        let (head, _vm) = head(2, 0.5);
        let hidden = Tensor::randn(0f32, 1f32, (2, 4, 6), &Device::Cpu).unwrap();
        let spans = MentionSpans::from_lists(&[vec![(0, 0), (1, 2)], vec![(3, 3)]]);
        let scores = head.score(&hidden, &spans, false).unwrap();
        assert_eq!(scores.mention_logits.dims(), &[2, 2]);
        assert_eq!(scores.coref_logits.dims(), &[2, 2, 3]);
        let logits = scores.coref_logits.to_vec3::<f32>().unwrap();
        assert_eq!(logits[0][0][2], 0.0, "null antecedent scores zero");
        assert!(logits[0][0][0] <= MASKED_SCORE / 2.0, "a mention cannot be its own antecedent");
        assert!(logits[0][1][0] > MASKED_SCORE / 2.0, "earlier mention is a legal antecedent");
    }

    #[test]
    fn dropout_masks_follow_the_seed() {
        let xs = Tensor::ones((4, 16), DType::F32, &Device::Cpu).unwrap();
        let draw = |seed: u64| {
            let dropout = SeededDropout::new(0.5, seed);
            let first = dropout.forward(&xs, true).unwrap().to_vec2::<f32>().unwrap();
            let second = dropout.forward(&xs, true).unwrap().to_vec2::<f32>().unwrap();
            (first, second)
        };
        let (a1, a2) = draw(7);
        let (b1, b2) = draw(7);
        assert_eq!(a1, b1);
        assert_eq!(a2, b2);
        assert_ne!(a1, a2, "consecutive masks differ");
        // kept units are rescaled by 1 / (1 - p)
        assert!(a1.iter().flatten().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn dropout_is_identity_at_eval() {
        let xs = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = SeededDropout::new(0.9, 1).forward(&xs, false).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0; 3]; 2]);
    }
}
