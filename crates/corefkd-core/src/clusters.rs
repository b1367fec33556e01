//! Turning antecedent scores into coreference clusters.

/// An inclusive `(start, end)` span.
pub type Span = (usize, usize);

/// A set of spans referring to the same entity.
pub type Cluster = Vec<Span>;

/// Pick the best antecedent of every real mention.
///
/// `logits` is one document's `[k][k + 1]` score matrix with the null
/// antecedent in the last column.  Returns `None` for mentions whose best
/// choice is the null antecedent.
pub fn best_antecedents(logits: &[Vec<f32>], num_valid: usize) -> Vec<Option<usize>> {
    logits
        .iter()
        .take(num_valid)
        .map(|row| {
            let null = row.len() - 1;
            let best = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(j, _)| j)
                .unwrap_or(null);
            (best != null).then_some(best)
        })
        .collect()
}

/// Group mentions linked by antecedent edges into clusters.
///
/// Mentions that neither point to nor are pointed at by another mention are
/// singletons and are dropped.  Clusters are returned sorted by their first
/// span, spans inside a cluster sorted by position.
pub fn build_clusters(spans: &[Span], antecedents: &[Option<usize>]) -> Vec<Cluster> {
    let mut parent: Vec<usize> = (0..spans.len()).collect();
    let mut linked = vec![false; spans.len()];

    for (i, ante) in antecedents.iter().enumerate() {
        if let Some(j) = *ante {
            if j >= spans.len() || j == i {
                continue;
            }
            linked[i] = true;
            linked[j] = true;
            let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
            if ri != rj {
                parent[ri.max(rj)] = ri.min(rj);
            }
        }
    }

    let mut by_root: std::collections::BTreeMap<usize, Cluster> = Default::default();
    for i in 0..spans.len() {
        if linked[i] {
            let root = find(&mut parent, i);
            by_root.entry(root).or_default().push(spans[i]);
        }
    }

    let mut clusters: Vec<Cluster> = by_root
        .into_values()
        .map(|mut c| {
            c.sort_unstable();
            c.dedup();
            c
        })
        .collect();
    clusters.sort();
    clusters
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Map subword-level clusters back to word offsets.
///
/// `subword_to_word[i]` is the word owning subword `i`.  Spans whose mapped
/// form collides with an earlier span of the same cluster are merged.
pub fn to_word_clusters(clusters: &[Cluster], subword_to_word: &[usize]) -> Vec<Cluster> {
    clusters
        .iter()
        .map(|cluster| {
            let mut words: Cluster = cluster
                .iter()
                .filter_map(|&(s, e)| Some((*subword_to_word.get(s)?, *subword_to_word.get(e)?)))
                .collect();
            words.sort_unstable();
            words.dedup();
            words
        })
        .filter(|c| c.len() > 1)
        .collect()
}
