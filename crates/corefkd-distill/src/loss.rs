//! Coreference and distillation losses.
//!
//! All losses take antecedent logits of shape `[B, K, K + 1]` (null column
//! last) and a `[B, K]` validity mask; padding mentions contribute nothing.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Tensor, D};

use corefkd_core::{Cluster, MentionSpans};

/// Additive penalty that removes an entry from a log-sum-exp.
const EXCLUDED: f64 = -1e4;

/// `1.0` where column `j` is a gold antecedent of mention `i`, flattened
/// over `[B, K, K + 1]`.  Mentions with no gold antecedent (including
/// non-gold spans) point at the null column.
pub fn gold_antecedents(spans: &MentionSpans, gold: &[&[Cluster]]) -> Vec<f32> {
    let k = spans.k;
    let width = k + 1;
    let mut out = vec![0.0f32; spans.num_docs() * k * width];

    for (doc, clusters) in gold.iter().enumerate() {
        let cluster_of: HashMap<(usize, usize), usize> = clusters
            .iter()
            .enumerate()
            .flat_map(|(c, spans)| spans.iter().map(move |&s| (s, c)))
            .collect();
        let n = spans.num_valid[doc];
        let ids: Vec<Option<usize>> = (0..n)
            .map(|i| cluster_of.get(&(spans.starts[doc][i], spans.ends[doc][i])).copied())
            .collect();

        for i in 0..k {
            let row = (doc * k + i) * width;
            let mut found = false;
            if i < n {
                if let Some(c) = ids[i] {
                    for j in 0..i {
                        if ids[j] == Some(c) {
                            out[row + j] = 1.0;
                            found = true;
                        }
                    }
                }
            }
            if !found {
                out[row + k] = 1.0;
            }
        }
    }
    out
}

/// `log Σ exp(x)` along the last dimension, without the trailing axis.
fn logsumexp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?.detach();
    let summed = x.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(summed.add(&max)?.squeeze(D::Minus1)?)
}

/// Mean over valid mentions of a per-mention `[B, K]` loss.
fn masked_mean(per_mention: &Tensor, validity: &Tensor) -> Result<Tensor> {
    let count = validity.sum_all()?.to_scalar::<f32>()?.max(1.0);
    Ok(per_mention.mul(validity)?.sum_all()?.affine(1.0 / count as f64, 0.0)?)
}

/// Negative marginal log-likelihood of the gold antecedents.
pub fn coref_loss(coref_logits: &Tensor, gold: &Tensor, validity: &Tensor) -> Result<Tensor> {
    let logits = coref_logits.to_dtype(DType::F32)?;
    let gold_logits = logits.add(&gold.affine(-EXCLUDED, EXCLUDED)?)?;
    let per_mention = logsumexp(&logits)?.sub(&logsumexp(&gold_logits)?)?;
    masked_mean(&per_mention, validity)
}

/// `T² · KL(teacher ‖ student)` on temperature-softened antecedent
/// distributions.
pub fn kd_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    validity: &Tensor,
    temperature: f64,
) -> Result<Tensor> {
    let s = student_logits.to_dtype(DType::F32)?.affine(1.0 / temperature, 0.0)?;
    let t = teacher_logits.to_dtype(DType::F32)?.detach().affine(1.0 / temperature, 0.0)?;
    let log_p_s = candle_nn::ops::log_softmax(&s, D::Minus1)?;
    let log_p_t = candle_nn::ops::log_softmax(&t, D::Minus1)?;
    let p_t = log_p_t.exp()?;
    let per_mention = p_t.mul(&log_p_t.sub(&log_p_s)?)?.sum(D::Minus1)?;
    Ok(masked_mean(&per_mention, validity)?.affine(temperature * temperature, 0.0)?)
}

/// `α · kd + (1 − α) · gold`.
pub fn combine(kd: &Tensor, gold: &Tensor, alpha: f64) -> Result<Tensor> {
    Ok(kd.affine(alpha, 0.0)?.add(&gold.affine(1.0 - alpha, 0.0)?)?)
}
