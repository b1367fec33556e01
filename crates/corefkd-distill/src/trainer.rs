//! Distillation training loop.
//!
//! The student is trained on the gold marginal log-likelihood and, when a
//! teacher is present, on the temperature-softened KL divergence between the
//! teacher's and the student's antecedent distributions over the *student's*
//! proposed mentions.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use serde::Serialize;
use tracing::{debug, info};

use corefkd_core::{Cluster, CorefModel};

use crate::eval::Evaluator;
use crate::loss::{coref_loss, combine, gold_antecedents, kd_loss};
use crate::output::DistilError;
use crate::progress::{format_duration, progress_bar};
use crate::sampler::Batches;
use crate::tracking::TrackingRun;

// ── Arguments ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TrainingArgs {
    pub num_train_epochs: usize,
    /// Peak learning rate of the encoder parameters.
    pub learning_rate: f64,
    /// Peak learning rate of the coreference head.
    pub head_learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub warmup_steps: usize,
    /// Global gradient-norm ceiling; `0` disables clipping.
    pub max_grad_norm: f64,
    pub logging_steps: usize,
    /// Evaluate (and keep the best checkpoint) every this many steps; `0`
    /// saves once at the end instead.
    pub eval_steps: usize,
    pub seed: u64,
    /// Softmax temperature of the distillation term.
    pub temperature: f64,
    /// Weight of the distillation term against the gold loss.
    pub alpha: f64,
    pub output_dir: PathBuf,
    /// Copied next to saved checkpoints.
    pub tokenizer_file: Option<PathBuf>,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            num_train_epochs: 3,
            learning_rate: 1e-5,
            head_learning_rate: 3e-4,
            weight_decay: 0.01,
            adam_beta1: 0.9,
            adam_beta2: 0.98,
            adam_epsilon: 1e-6,
            warmup_steps: 0,
            max_grad_norm: 1.0,
            logging_steps: 50,
            eval_steps: 0,
            seed: 42,
            temperature: 2.0,
            alpha: 0.5,
            output_dir: PathBuf::from("output"),
            tokenizer_file: None,
        }
    }
}

/// A frozen teacher and its batch stream, aligned with the student's.
pub struct Teacher<'m, 'b> {
    pub model: &'m CorefModel,
    pub batches: &'b Batches<'b>,
}

// ── Schedule and clipping ─────────────────────────────────────────────────────

/// Linear warm-up to 1 over `warmup` steps, then linear decay to 0 at `total`.
pub fn lr_factor(step: usize, warmup: usize, total: usize) -> f64 {
    if step < warmup {
        return step as f64 / warmup.max(1) as f64;
    }
    let remaining = total.saturating_sub(step) as f64;
    let span = total.saturating_sub(warmup).max(1) as f64;
    (remaining / span).max(0.0)
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.  Variables without a gradient are
/// ignored.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut squared = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            squared += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = squared.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let clipped = grads.get(var).map(|g| g.affine(scale, 0.0)).transpose()?;
            if let Some(clipped) = clipped {
                grads.insert(var, clipped);
            }
        }
    }
    Ok(norm)
}

/// Fail unless both plans hold the same documents batch for batch.
pub fn check_alignment(student: &Batches, teacher: &Batches) -> Result<(), DistilError> {
    for index in 0..student.len().max(teacher.len()) {
        let s = student.batches().get(index).map(|b| student.doc_keys(b)).unwrap_or_default();
        let t = teacher.batches().get(index).map(|b| teacher.doc_keys(b)).unwrap_or_default();
        if s != t {
            return Err(DistilError::BatchMismatch {
                index,
                student: s.into_iter().map(String::from).collect(),
                teacher: t.into_iter().map(String::from).collect(),
            });
        }
    }
    Ok(())
}

// ── Training ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Window {
    steps: usize,
    loss: f64,
    gold: f64,
    kd: f64,
    grad_norm: f64,
}

/// Train `student`, returning `(global_step, average_loss)`.
pub fn train(
    args: &TrainingArgs,
    student_batches: &Batches,
    teacher: Option<Teacher<'_, '_>>,
    student: &CorefModel,
    evaluator: &Evaluator,
    mut tracker: Option<&mut TrackingRun>,
) -> Result<(usize, f64)> {
    if let Some(t) = &teacher {
        check_alignment(student_batches, t.batches)?;
    }

    let (encoder_vars, head_vars) = student.trainable_vars()?;
    let all_vars: Vec<Var> = encoder_vars.iter().chain(head_vars.iter()).cloned().collect();
    let adam = |lr: f64| ParamsAdamW {
        lr,
        beta1: args.adam_beta1,
        beta2: args.adam_beta2,
        eps: args.adam_epsilon,
        weight_decay: args.weight_decay,
    };
    let mut encoder_opt = AdamW::new(encoder_vars, adam(args.learning_rate))
        .context("Failed to create encoder optimiser")?;
    let mut head_opt = AdamW::new(head_vars, adam(args.head_learning_rate))
        .context("Failed to create head optimiser")?;

    let steps_per_epoch = student_batches.len();
    let total_steps = steps_per_epoch * args.num_train_epochs;
    info!(
        epochs = args.num_train_epochs,
        steps_per_epoch,
        total_steps,
        lr = args.learning_rate,
        head_lr = args.head_learning_rate,
        distillation = teacher.is_some(),
        temperature = args.temperature,
        alpha = args.alpha,
        "Starting training"
    );

    let device = student.device();
    let pb = progress_bar(total_steps as u64, "Training");
    let started = Instant::now();

    let mut global_step = 0usize;
    let mut total_loss = 0.0f64;
    let mut window = Window::default();
    let mut best_f1: Option<f64> = None;
    let mut saved = false;

    for epoch in 0..args.num_train_epochs {
        let seed = args.seed + epoch as u64;
        let epoch_student = if epoch == 0 {
            student_batches.clone()
        } else {
            student_batches.reshuffled(seed)
        };
        let epoch_teacher = teacher.as_ref().map(|t| {
            if epoch == 0 {
                t.batches.clone()
            } else {
                t.batches.reshuffled(seed)
            }
        });

        for (index, batch) in epoch_student.batches().iter().enumerate() {
            let step = global_step + 1;
            let docs = epoch_student.documents(batch);
            let input = epoch_student.collate(batch, device).context("Student collation failed")?;

            let hidden = student.encode(&input).context("Student forward failed")?;
            let spans = student.propose(&hidden, &input.doc_lens)?;
            let scores = student.score(&hidden, &spans, true)?;

            let gold: Vec<&[Cluster]> = docs.iter().map(|d| d.clusters.as_slice()).collect();
            let (b, k) = (spans.num_docs(), spans.k);
            let gold_t = Tensor::from_vec(gold_antecedents(&spans, &gold), (b, k, k + 1), device)?;
            let validity = Tensor::from_vec(spans.validity(), (b, k), device)?;
            let gold_loss = coref_loss(&scores.coref_logits, &gold_t, &validity)?;

            let (loss, kd_value) = match (&teacher, &epoch_teacher) {
                (Some(t), Some(tb)) => {
                    let t_batch = &tb.batches()[index];
                    let t_input = tb
                        .collate(t_batch, t.model.device())
                        .context("Teacher collation failed")?;
                    let t_hidden = t.model.encode(&t_input).context("Teacher forward failed")?;
                    let t_scores = t.model.score(&t_hidden, &spans, false)?;
                    let t_logits = t_scores.coref_logits.to_device(device)?;
                    let kd = kd_loss(&scores.coref_logits, &t_logits, &validity, args.temperature)?;
                    let kd_value = kd.to_scalar::<f32>()? as f64;
                    (combine(&kd, &gold_loss, args.alpha)?, kd_value)
                }
                _ => (gold_loss.clone(), 0.0),
            };

            let loss_value = loss.to_scalar::<f32>()?;
            if !loss_value.is_finite() {
                pb.abandon();
                return Err(DistilError::NonFiniteLoss { step, loss: loss_value }.into());
            }

            let mut grads = loss.backward().context("Backward pass failed")?;
            let grad_norm = clip_grad_norm(&mut grads, &all_vars, args.max_grad_norm)?;

            let factor = lr_factor(global_step, args.warmup_steps, total_steps);
            encoder_opt.set_learning_rate(args.learning_rate * factor);
            head_opt.set_learning_rate(args.head_learning_rate * factor);
            encoder_opt.step(&grads).context("Encoder optimiser step failed")?;
            head_opt.step(&grads).context("Head optimiser step failed")?;

            global_step = step;
            total_loss += loss_value as f64;
            window.steps += 1;
            window.loss += loss_value as f64;
            window.gold += gold_loss.to_scalar::<f32>()? as f64;
            window.kd += kd_value;
            window.grad_norm += grad_norm;
            debug!(step, loss = loss_value, grad_norm, "Step");

            pb.set_message(format!(
                "epoch {}/{} loss {:.4}",
                epoch + 1,
                args.num_train_epochs,
                loss_value
            ));
            pb.inc(1);

            if args.logging_steps > 0 && global_step % args.logging_steps == 0 {
                let n = window.steps as f64;
                let metrics = [
                    ("loss", window.loss / n),
                    ("gold_loss", window.gold / n),
                    ("kd_loss", window.kd / n),
                    ("grad_norm", window.grad_norm / n),
                    ("learning_rate", encoder_opt.learning_rate()),
                    ("head_learning_rate", head_opt.learning_rate()),
                ];
                info!(
                    step = global_step,
                    epoch = epoch + 1,
                    loss = metrics[0].1,
                    gold_loss = metrics[1].1,
                    kd_loss = metrics[2].1,
                    grad_norm = metrics[3].1,
                    lr = metrics[4].1,
                    head_lr = metrics[5].1,
                    "Training progress"
                );
                if let Some(run) = tracker.as_deref_mut() {
                    run.log_metrics(global_step, &metrics)?;
                }
                window = Window::default();
            }

            if args.eval_steps > 0 && global_step % args.eval_steps == 0 {
                let results = evaluator.evaluate(student)?.results;
                if let Some(run) = tracker.as_deref_mut() {
                    run.log_metrics(
                        global_step,
                        &[("eval_loss", results.loss), ("eval_conll_f1", results.conll_f1)],
                    )?;
                }
                if best_f1.map_or(true, |best| results.conll_f1 > best) {
                    info!(
                        step = global_step,
                        conll_f1 = results.conll_f1,
                        "New best model, saving"
                    );
                    best_f1 = Some(results.conll_f1);
                    student
                        .save(&args.output_dir, args.tokenizer_file.as_deref())
                        .context("Failed to save checkpoint")?;
                    saved = true;
                }
            }
        }

        info!(epoch = epoch + 1, step = global_step, "Epoch complete");
    }

    let average_loss = if global_step == 0 {
        0.0
    } else {
        total_loss / global_step as f64
    };
    pb.finish_with_message(format!("done, average loss {average_loss:.4}"));

    if !saved {
        student
            .save(&args.output_dir, args.tokenizer_file.as_deref())
            .context("Failed to save final model")?;
    }

    info!(
        steps = global_step,
        average_loss,
        best_conll_f1 = ?best_f1,
        elapsed = %format_duration(started.elapsed().as_secs()),
        "Training complete"
    );
    Ok((global_step, average_loss))
}
