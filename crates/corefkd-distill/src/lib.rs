//! # corefkd-distill
//!
//! Knowledge distillation for coreference resolution.
//!
//! A compact *student* coreference model is trained on gold clusters and on
//! the antecedent distributions of a larger frozen *teacher*, then evaluated
//! with the CoNLL metrics (MUC, B³, CEAFe).
//!
//! The pipeline, bottom-up:
//!
//! 1. [`dataset::create`] loads jsonlines splits into tokenised documents.
//! 2. A [`collate::Collator`] lays documents out as encoder rows: fixed
//!    segments for the student, whole documents for the teacher.
//! 3. [`sampler::DynamicBatchSampler`] packs documents into token-budgeted
//!    batches; student and teacher plans over the same split are identical.
//! 4. [`trainer::train`] runs the distillation loop.
//! 5. [`eval::Evaluator`] scores predictions and writes them out.
//!
//! ## Usage
//!
//! ```text
//! corefkd distil \
//!   --model-name-or-path  ./models/bert-small \
//!   --teacher             ./models/coref-large \
//!   --train-file          data/train.jsonl \
//!   --dev-file            data/dev.jsonl \
//!   --output-dir          ./output/student \
//!   --do-train
//! ```

pub mod collate;
pub mod dataset;
pub mod eval;
pub mod loss;
pub mod metrics;
pub mod output;
mod progress;
pub mod sampler;
pub mod tracking;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use collate::{Collator, LongDocCollator, SegmentCollator};
pub use dataset::{DatasetFiles, Document, SplitMap};
pub use eval::{EvalResults, Evaluation, Evaluator};
pub use metrics::{CorefEvaluator, Scores};
pub use output::{prepare_output_dir, DistilError};
pub use sampler::{create_batches, Batches, DynamicBatchSampler, TRAIN_MAX_DOC_LEN};
pub use tracking::{RunStatus, TrackingRun};
pub use trainer::{train, Teacher, TrainingArgs};
