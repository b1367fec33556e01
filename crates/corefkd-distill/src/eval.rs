//! Evaluation of a coreference model on one split.
//!
//! The evaluator owns a batch plan, runs the model without dropout, and
//! scores word-level predicted clusters against gold with the CoNLL metrics.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;

use corefkd_core::{decode_clusters, to_word_clusters, Cluster, CorefModel};

use crate::loss::{coref_loss, gold_antecedents};
use crate::metrics::{CorefEvaluator, Scores};
use crate::progress::{format_duration, progress_bar};
use crate::sampler::{create_batches, Batches, DynamicBatchSampler};

pub const EVAL_RESULTS_FILE: &str = "eval_results.json";

#[derive(Debug, Clone, Serialize)]
pub struct EvalResults {
    pub split: String,
    pub num_docs: usize,
    /// Mean gold coreference loss over batches.
    pub loss: f64,
    pub muc: Scores,
    pub b_cubed: Scores,
    pub ceafe: Scores,
    pub mentions: Scores,
    pub conll_f1: f64,
}

/// Predicted clusters of one document, in word offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocPrediction {
    pub doc_key: String,
    pub clusters: Vec<Vec<[usize; 2]>>,
}

pub struct Evaluation {
    pub results: EvalResults,
    pub predictions: Vec<DocPrediction>,
}

pub struct Evaluator<'a> {
    batches: Batches<'a>,
    split: String,
    output_dir: Option<PathBuf>,
    output_file: Option<PathBuf>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        sampler: &DynamicBatchSampler<'a>,
        split: &str,
        output_dir: Option<&Path>,
        output_file: Option<&Path>,
    ) -> Self {
        Self {
            batches: create_batches(sampler),
            split: split.to_string(),
            output_dir: output_dir.map(Path::to_path_buf),
            output_file: output_file.map(Path::to_path_buf),
        }
    }

    /// Run `model` over every evaluation batch.
    pub fn evaluate(&self, model: &CorefModel) -> Result<Evaluation> {
        let started = Instant::now();
        let device = model.device();
        let pb = progress_bar(self.batches.len() as u64, &format!("Evaluating {}", self.split));

        let mut scorer = CorefEvaluator::new();
        let mut predictions = Vec::with_capacity(self.batches.num_docs());
        let mut loss_sum = 0.0f64;

        for batch in self.batches.batches() {
            let docs = self.batches.documents(batch);
            let input = self.batches.collate(batch, device).context("Collation failed")?;

            let hidden = model.encode(&input).context("Encoder forward failed")?;
            let spans = model.propose(&hidden, &input.doc_lens)?;
            let scores = model.score(&hidden, &spans, false)?;

            let gold: Vec<&[Cluster]> = docs.iter().map(|d| d.clusters.as_slice()).collect();
            let (b, k) = (spans.num_docs(), spans.k);
            let gold_t = Tensor::from_vec(gold_antecedents(&spans, &gold), (b, k, k + 1), device)?;
            let validity = Tensor::from_vec(spans.validity(), (b, k), device)?;
            loss_sum +=
                coref_loss(&scores.coref_logits, &gold_t, &validity)?.to_scalar::<f32>()? as f64;

            for (doc, clusters) in docs.iter().zip(decode_clusters(&spans, &scores)?) {
                let words = to_word_clusters(&clusters, &doc.subword_to_word);
                scorer.update(&words, &doc.word_clusters);
                predictions.push(DocPrediction {
                    doc_key: doc.doc_key.clone(),
                    clusters: words
                        .iter()
                        .map(|c| c.iter().map(|&(s, e)| [s, e]).collect())
                        .collect(),
                });
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let loss = if self.batches.is_empty() {
            0.0
        } else {
            loss_sum / self.batches.len() as f64
        };
        let results = EvalResults {
            split: self.split.clone(),
            num_docs: predictions.len(),
            loss,
            muc: scorer.muc(),
            b_cubed: scorer.b_cubed(),
            ceafe: scorer.ceafe(),
            mentions: scorer.mentions(),
            conll_f1: scorer.conll_f1(),
        };

        info!(
            split = %results.split,
            docs = results.num_docs,
            loss = results.loss,
            muc_f1 = results.muc.f1,
            b_cubed_f1 = results.b_cubed.f1,
            ceafe_f1 = results.ceafe.f1,
            mention_f1 = results.mentions.f1,
            conll_f1 = results.conll_f1,
            elapsed = %format_duration(started.elapsed().as_secs()),
            "Evaluation complete"
        );
        Ok(Evaluation { results, predictions })
    }

    /// Where predictions go: `--output-file`, else `<output_dir>/<split>_predictions.jsonl`.
    pub fn predictions_path(&self) -> Option<PathBuf> {
        self.output_file.clone().or_else(|| {
            self.output_dir
                .as_ref()
                .map(|d| d.join(format!("{}_predictions.jsonl", self.split)))
        })
    }

    /// Persist results and predictions; returns the files written.
    pub fn write(&self, evaluation: &Evaluation) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        if let Some(dir) = &self.output_dir {
            let path = dir.join(EVAL_RESULTS_FILE);
            let json = serde_json::to_string_pretty(&evaluation.results)?;
            std::fs::write(&path, json)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            written.push(path);
        }

        if let Some(path) = self.predictions_path() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create {}", parent.display()))?;
            }
            let file = File::create(&path)
                .with_context(|| format!("Cannot create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            for prediction in &evaluation.predictions {
                serde_json::to_writer(&mut writer, prediction)?;
                writer.write_all(b"\n")?;
            }
            writer.flush().with_context(|| format!("Cannot write {}", path.display()))?;
            written.push(path);
        }

        for path in &written {
            info!(path = %path.display(), "Evaluation output written");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::SegmentCollator;
    use crate::dataset::{load_file, test_support::write_split};
    use crate::testing::write_tiny_model;
    use corefkd_core::Tokenizer;
    use tempfile::TempDir;

    #[test]
    fn evaluates_and_writes_outputs() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("model");
        let model = write_tiny_model(&model_dir, 8);
        let tokenizer = Tokenizer::from_file(&model_dir.join("tokenizer.json")).unwrap();
        let docs = load_file(&write_split(tmp.path(), "dev"), &tokenizer).unwrap();

        let collator = SegmentCollator::new(&tokenizer, 8);
        let sampler = DynamicBatchSampler::new(&docs, &collator, 32, 8);
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let evaluator = Evaluator::new(&sampler, "dev", Some(&out), None);

        let evaluation = evaluator.evaluate(&model).unwrap();
        assert_eq!(evaluation.results.num_docs, 4);
        assert!(evaluation.results.loss.is_finite() && evaluation.results.loss >= 0.0);
        assert!((0.0..=1.0).contains(&evaluation.results.conll_f1));
        for prediction in &evaluation.predictions {
            assert!(prediction.clusters.iter().all(|c| c.len() >= 2));
        }

        let written = evaluator.write(&evaluation).unwrap();
        assert_eq!(written, vec![out.join(EVAL_RESULTS_FILE), out.join("dev_predictions.jsonl")]);
        let lines = std::fs::read_to_string(out.join("dev_predictions.jsonl")).unwrap();
        let keys: Vec<String> = lines
            .lines()
            .map(|l| serde_json::from_str::<DocPrediction>(l).unwrap().doc_key)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn output_file_takes_precedence() {
        let tmp = TempDir::new().unwrap();
        let tokenizer_path = crate::dataset::test_support::write_tokenizer(tmp.path());
        let tokenizer = Tokenizer::from_file(&tokenizer_path).unwrap();
        let docs = load_file(&write_split(tmp.path(), "test"), &tokenizer).unwrap();
        let collator = SegmentCollator::new(&tokenizer, 8);
        let sampler = DynamicBatchSampler::new(&docs, &collator, 32, 8);

        let file = tmp.path().join("preds").join("out.jsonl");
        let evaluator = Evaluator::new(&sampler, "test", Some(tmp.path()), Some(&file));
        assert_eq!(evaluator.predictions_path(), Some(file));

        let evaluator = Evaluator::new(&sampler, "test", None, None);
        assert_eq!(evaluator.predictions_path(), None);
    }
}
