//! Coreference metrics: MUC, B³, CEAFe, their CoNLL average, and mention
//! detection.
//!
//! Singleton clusters are ignored by B³ and CEAFe, as in the CoNLL-2012
//! scorer setup used for OntoNotes.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use corefkd_core::{Cluster, Span};

/// Accumulated precision / recall fractions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Prf {
    pub p_num: f64,
    pub p_den: f64,
    pub r_num: f64,
    pub r_den: f64,
}

impl Prf {
    pub fn precision(&self) -> f64 {
        if self.p_den == 0.0 {
            0.0
        } else {
            self.p_num / self.p_den
        }
    }

    pub fn recall(&self) -> f64 {
        if self.r_den == 0.0 {
            0.0
        } else {
            self.r_num / self.r_den
        }
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    fn add(&mut self, other: Prf) {
        self.p_num += other.p_num;
        self.p_den += other.p_den;
        self.r_num += other.r_num;
        self.r_den += other.r_den;
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl From<Prf> for Scores {
    fn from(p: Prf) -> Self {
        Self { precision: p.precision(), recall: p.recall(), f1: p.f1() }
    }
}

/// Corpus-level accumulator; documents are added one at a time.
#[derive(Debug, Clone, Default)]
pub struct CorefEvaluator {
    muc: Prf,
    b_cubed: Prf,
    ceafe: Prf,
    mentions: Prf,
}

impl CorefEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, predicted: &[Cluster], gold: &[Cluster]) {
        let pred_map = mention_to_cluster(predicted);
        let gold_map = mention_to_cluster(gold);

        self.muc.add(Prf {
            p_num: muc_numerator(predicted, &gold_map),
            p_den: predicted.iter().map(|c| c.len().saturating_sub(1) as f64).sum(),
            r_num: muc_numerator(gold, &pred_map),
            r_den: gold.iter().map(|c| c.len().saturating_sub(1) as f64).sum(),
        });

        let (p_num, p_den) = b_cubed(predicted, gold, &gold_map);
        let (r_num, r_den) = b_cubed(gold, predicted, &pred_map);
        self.b_cubed.add(Prf { p_num, p_den, r_num, r_den });

        self.ceafe.add(ceafe(predicted, gold));

        let pred_mentions: HashSet<Span> = predicted.iter().flatten().copied().collect();
        let gold_mentions: HashSet<Span> = gold.iter().flatten().copied().collect();
        let correct = pred_mentions.intersection(&gold_mentions).count() as f64;
        self.mentions.add(Prf {
            p_num: correct,
            p_den: pred_mentions.len() as f64,
            r_num: correct,
            r_den: gold_mentions.len() as f64,
        });
    }

    pub fn muc(&self) -> Scores {
        self.muc.into()
    }

    pub fn b_cubed(&self) -> Scores {
        self.b_cubed.into()
    }

    pub fn ceafe(&self) -> Scores {
        self.ceafe.into()
    }

    pub fn mentions(&self) -> Scores {
        self.mentions.into()
    }

    /// Mean F1 of MUC, B³ and CEAFe.
    pub fn conll_f1(&self) -> f64 {
        (self.muc.f1() + self.b_cubed.f1() + self.ceafe.f1()) / 3.0
    }
}

fn mention_to_cluster(clusters: &[Cluster]) -> HashMap<Span, usize> {
    clusters
        .iter()
        .enumerate()
        .flat_map(|(i, c)| c.iter().map(move |&m| (m, i)))
        .collect()
}

/// `Σ (|K| − |partition of K by the other side|)`; unmatched mentions are
/// their own partition.
fn muc_numerator(clusters: &[Cluster], other: &HashMap<Span, usize>) -> f64 {
    clusters
        .iter()
        .map(|c| {
            let mut parts = HashSet::new();
            let mut unmatched = 0usize;
            for m in c {
                match other.get(m) {
                    Some(&i) => {
                        parts.insert(i);
                    }
                    None => unmatched += 1,
                }
            }
            (c.len() - parts.len() - unmatched) as f64
        })
        .sum()
}

fn b_cubed(
    clusters: &[Cluster],
    other: &[Cluster],
    other_map: &HashMap<Span, usize>,
) -> (f64, f64) {
    let mut num = 0.0;
    let mut den = 0.0;
    for c in clusters.iter().filter(|c| c.len() > 1) {
        let mut overlap: HashMap<usize, usize> = HashMap::new();
        for m in c {
            if let Some(&i) = other_map.get(m) {
                *overlap.entry(i).or_default() += 1;
            }
        }
        let correct: usize = overlap
            .iter()
            .filter(|(&i, _)| other[i].len() > 1)
            .map(|(_, &n)| n * n)
            .sum();
        num += correct as f64 / c.len() as f64;
        den += c.len() as f64;
    }
    (num, den)
}

fn phi4(a: &Cluster, b: &Cluster) -> f64 {
    let set: HashSet<&Span> = a.iter().collect();
    let common = b.iter().filter(|m| set.contains(m)).count();
    2.0 * common as f64 / (a.len() + b.len()) as f64
}

fn ceafe(predicted: &[Cluster], gold: &[Cluster]) -> Prf {
    let predicted: Vec<&Cluster> = predicted.iter().filter(|c| c.len() > 1).collect();
    let gold: Vec<&Cluster> = gold.iter().filter(|c| c.len() > 1).collect();

    let similarity: Vec<Vec<f64>> = gold
        .iter()
        .map(|g| predicted.iter().map(|p| phi4(g, p)).collect())
        .collect();
    let total: f64 = max_weight_matching(&similarity)
        .into_iter()
        .map(|(i, j)| similarity[i][j])
        .sum();

    Prf { p_num: total, p_den: predicted.len() as f64, r_num: total, r_den: gold.len() as f64 }
}

/// Maximum-weight assignment between rows and columns (Kuhn–Munkres).
///
/// Returns `(row, col)` pairs; with a rectangular matrix only
/// `min(rows, cols)` pairs are produced.
pub fn max_weight_matching(weights: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let rows = weights.len();
    let cols = weights.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    let n = rows.max(cols);
    let max_w = weights.iter().flatten().copied().fold(0.0f64, f64::max);
    // Square cost matrix, 1-indexed; padding cells cost as much as a zero weight.
    let cost = |i: usize, j: usize| -> f64 {
        if i <= rows && j <= cols {
            max_w - weights[i - 1][j - 1]
        } else {
            max_w
        }
    };

    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=n {
                if !used[j] {
                    let cur = cost(i0, j) - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    (1..=n)
        .filter(|&j| p[j] >= 1 && p[j] <= rows && j <= cols)
        .map(|j| (p[j] - 1, j - 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gold() -> Vec<Cluster> {
        vec![vec![(0, 0), (1, 1), (2, 2), (3, 3)]]
    }

    fn split_prediction() -> Vec<Cluster> {
        vec![vec![(0, 0), (1, 1)], vec![(2, 2), (3, 3)]]
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let clusters = vec![vec![(0, 0), (4, 5)], vec![(1, 2), (7, 7), (9, 9)]];
        let mut ev = CorefEvaluator::new();
        ev.update(&clusters, &clusters);
        for s in [ev.muc(), ev.b_cubed(), ev.ceafe(), ev.mentions()] {
            assert_abs_diff_eq!(s.f1, 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(ev.conll_f1(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn muc_on_split_cluster() {
        let mut ev = CorefEvaluator::new();
        ev.update(&split_prediction(), &gold());
        let muc = ev.muc();
        assert_abs_diff_eq!(muc.recall, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(muc.precision, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn b_cubed_on_split_cluster() {
        let mut ev = CorefEvaluator::new();
        ev.update(&split_prediction(), &gold());
        let b3 = ev.b_cubed();
        assert_abs_diff_eq!(b3.recall, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(b3.precision, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn ceafe_on_split_cluster() {
        let mut ev = CorefEvaluator::new();
        ev.update(&split_prediction(), &gold());
        let ceafe = ev.ceafe();
        assert_abs_diff_eq!(ceafe.recall, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ceafe.precision, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_prediction_scores_zero() {
        let mut ev = CorefEvaluator::new();
        ev.update(&[], &gold());
        assert_eq!(ev.conll_f1(), 0.0);
        assert_eq!(ev.mentions().recall, 0.0);
    }

    #[test]
    fn matching_prefers_global_optimum() {
        // Greedy row-by-row would take (0,0)=0.9 then (1,1)=0.1; the optimum is 0.8 + 0.8.
        let w = vec![vec![0.9, 0.8], vec![0.8, 0.1]];
        let mut m = max_weight_matching(&w);
        m.sort_unstable();
        assert_eq!(m, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn matching_rectangular() {
        let w = vec![vec![0.1, 0.7, 0.3]];
        assert_eq!(max_weight_matching(&w), vec![(0, 1)]);
        let tall = vec![vec![0.2], vec![0.9], vec![0.4]];
        assert_eq!(max_weight_matching(&tall), vec![(1, 0)]);
    }
}
