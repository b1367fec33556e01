//! `corefkd distil`: configure, optionally train, then evaluate a student.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Device;
use clap::Args;
use indicatif::MultiProgress;
use serde::Serialize;
use tracing::{info, warn};

use corefkd_core::{
    device::device_name, seed_device, select_device, select_device_spec, CorefModel, DeviceSpec,
    HeadConfig, ModelRole, Tokenizer,
};
use corefkd_distill::{
    create_batches, dataset, prepare_output_dir, train, DatasetFiles, DynamicBatchSampler,
    EvalResults, Evaluator, LongDocCollator, RunStatus, SegmentCollator, Teacher, TrackingRun,
    TrainingArgs, TRAIN_MAX_DOC_LEN,
};
use corefkd_hub::resolve_model;

use crate::config::{expand_cache_dir, AppConfig};

#[derive(Debug, Clone, Args)]
pub struct DistilArgs {
    /// Student base model: a local directory or a Hugging Face repo id
    /// (`owner/repo[@revision]`).
    #[arg(long, short = 'm')]
    pub model_name_or_path: String,

    /// Trained coreference teacher (local directory or repo id).  Without
    /// it, training uses the gold loss only.
    #[arg(long)]
    pub teacher: Option<String>,

    #[arg(long, value_name = "FILE")]
    pub train_file: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub dev_file: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub test_file: Option<PathBuf>,

    /// Directory receiving checkpoints, eval results and predictions.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Predictions file (jsonlines); defaults to `<output-dir>/<split>_predictions.jsonl`.
    #[arg(long, value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// Delete an existing output directory instead of failing.
    #[arg(long)]
    pub overwrite_output_dir: bool,

    #[arg(long)]
    pub do_train: bool,

    /// Split to evaluate (`train`, `dev` or `test`).
    #[arg(long)]
    pub eval_split: Option<String>,

    /// `cpu`, `cuda`, `cuda:N` or `metal`; defaults to the config's device section.
    #[arg(long)]
    pub device: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub max_segment_len: Option<usize>,

    #[arg(long)]
    pub max_tokens_in_batch: Option<usize>,

    #[arg(long)]
    pub num_train_epochs: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub head_learning_rate: Option<f64>,

    #[arg(long)]
    pub warmup_steps: Option<usize>,

    #[arg(long)]
    pub logging_steps: Option<usize>,

    #[arg(long)]
    pub eval_steps: Option<usize>,

    /// Distillation softmax temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Weight of the distillation loss (the gold loss gets `1 - alpha`).
    #[arg(long)]
    pub alpha: Option<f64>,

    #[arg(long)]
    pub top_lambda: Option<f64>,

    #[arg(long)]
    pub max_span_length: Option<usize>,

    /// Record params and metrics under `<tracking.dir>/<name>/`.
    #[arg(long)]
    pub experiment_name: Option<String>,
}

/// Everything a run depends on after flags and config are merged.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub model_name_or_path: String,
    pub teacher: Option<String>,
    pub train_file: Option<PathBuf>,
    pub dev_file: Option<PathBuf>,
    pub test_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub overwrite_output_dir: bool,
    pub do_train: bool,
    pub eval_split: String,
    pub device: Option<String>,
    pub cache_dir: PathBuf,
    pub max_segment_len: usize,
    pub max_tokens_in_batch: usize,
    pub head: HeadConfig,
    pub training: TrainingArgs,
    pub experiment_name: Option<String>,
    pub tracking_dir: PathBuf,
    /// Filled in once the dataset is loaded.
    pub dataset_files: Option<DatasetFiles>,
}

impl DistilArgs {
    /// Merge flags over the layered configuration.
    pub fn resolve(self, cfg: &AppConfig) -> RunConfig {
        let t = &cfg.training;
        let mut head = cfg.head.clone();
        if let Some(v) = self.top_lambda {
            head.top_lambda = v;
        }
        if let Some(v) = self.max_span_length {
            head.max_span_length = v;
        }

        let training = TrainingArgs {
            num_train_epochs: self.num_train_epochs.unwrap_or(t.num_train_epochs),
            learning_rate: self.learning_rate.unwrap_or(t.learning_rate),
            head_learning_rate: self.head_learning_rate.unwrap_or(t.head_learning_rate),
            weight_decay: t.weight_decay,
            adam_beta1: t.adam_beta1,
            adam_beta2: t.adam_beta2,
            adam_epsilon: t.adam_epsilon,
            warmup_steps: self.warmup_steps.unwrap_or(t.warmup_steps),
            max_grad_norm: t.max_grad_norm,
            logging_steps: self.logging_steps.unwrap_or(t.logging_steps),
            eval_steps: self.eval_steps.unwrap_or(t.eval_steps),
            seed: self.seed.unwrap_or(t.seed),
            temperature: self.temperature.unwrap_or(t.temperature),
            alpha: self.alpha.unwrap_or(t.alpha),
            output_dir: self.output_dir.clone().unwrap_or_default(),
            tokenizer_file: None,
        };

        RunConfig {
            model_name_or_path: self.model_name_or_path,
            teacher: self.teacher,
            train_file: self.train_file,
            dev_file: self.dev_file,
            test_file: self.test_file,
            output_dir: self.output_dir,
            output_file: self.output_file,
            overwrite_output_dir: self.overwrite_output_dir,
            do_train: self.do_train,
            eval_split: self.eval_split.unwrap_or_else(|| cfg.data.eval_split.clone()),
            device: self.device,
            cache_dir: expand_cache_dir(&cfg.model.cache_dir),
            max_segment_len: self.max_segment_len.unwrap_or(cfg.data.max_segment_len),
            max_tokens_in_batch: self.max_tokens_in_batch.unwrap_or(cfg.data.max_tokens_in_batch),
            head,
            training,
            experiment_name: self.experiment_name,
            tracking_dir: PathBuf::from(&cfg.tracking.dir),
            dataset_files: None,
        }
    }
}

pub async fn run(args: DistilArgs, config: &AppConfig) -> Result<EvalResults> {
    let mut run = args.resolve(config);

    // ── Tracking ──────────────────────────────────────────────────────────────
    let mut tracker = match &run.experiment_name {
        Some(name) => Some(TrackingRun::start(&run.tracking_dir, name)?),
        None => None,
    };

    // ── Output directory ──────────────────────────────────────────────────────
    prepare_output_dir(
        run.output_dir.as_deref(),
        run.overwrite_output_dir,
        run.do_train,
        run.output_file.as_deref(),
    )?;

    // ── Device and seeding ────────────────────────────────────────────────────
    let device = resolve_device(run.device.as_deref(), config)?;
    seed_device(&device, run.training.seed);
    info!(device = device_name(&device), seed = run.training.seed, "Device selected");

    // ── Models ────────────────────────────────────────────────────────────────
    let mp = MultiProgress::new();
    let student_dir = resolve_model(&run.model_name_or_path, &run.cache_dir, Some(&mp))
        .await
        .with_context(|| format!("Cannot resolve student model '{}'", run.model_name_or_path))?;
    let tokenizer_file = student_dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_file)
        .with_context(|| format!("Cannot load tokenizer from {}", tokenizer_file.display()))?;
    run.training.tokenizer_file = Some(tokenizer_file);

    let seed = run.training.seed;
    let student = get_model(&student_dir, ModelRole::Trainable, &run.head, seed, &device)?;

    let teacher = match (&run.teacher, run.do_train) {
        (Some(name), true) => {
            let teacher_dir = resolve_model(name, &run.cache_dir, Some(&mp))
                .await
                .with_context(|| format!("Cannot resolve teacher model '{name}'"))?;
            let teacher = get_model(&teacher_dir, ModelRole::Frozen, &run.head, seed, &device)?;
            let (s_enc, s_head) = student.num_parameters();
            let (t_enc, t_head) = teacher.num_parameters();
            info!(
                ratio = %format!("{:.3}", (s_enc + s_head) / (t_enc + t_head)),
                "Student/teacher parameter ratio"
            );
            Some(teacher)
        }
        (Some(name), false) => {
            warn!(teacher = %name, "--teacher ignored without --do-train");
            None
        }
        (None, _) => None,
    };

    // ── Data ──────────────────────────────────────────────────────────────────
    let (splits, files) = dataset::create(
        &tokenizer,
        run.train_file.as_deref(),
        run.dev_file.as_deref(),
        run.test_file.as_deref(),
    )?;
    run.dataset_files = Some(files);

    if let Some(t) = tracker.as_mut() {
        t.log_params(&run)?;
    }

    let student_collator = SegmentCollator::new(&tokenizer, run.max_segment_len);
    let eval_docs = splits.get(&run.eval_split).ok_or_else(|| {
        anyhow!(
            "Evaluation split '{}' was not loaded; pass --{}-file",
            run.eval_split,
            run.eval_split
        )
    })?;
    let eval_sampler = DynamicBatchSampler::new(
        eval_docs,
        &student_collator,
        run.max_tokens_in_batch,
        run.max_segment_len,
    );
    let evaluator = Evaluator::new(
        &eval_sampler,
        &run.eval_split,
        run.output_dir.as_deref(),
        run.output_file.as_deref(),
    );

    // ── Training ──────────────────────────────────────────────────────────────
    let mut global_step = 0usize;
    if run.do_train {
        let Some(train_docs) = splits.get("train") else {
            bail!("--do-train requires --train-file");
        };

        let student_sampler = DynamicBatchSampler::new(
            train_docs,
            &student_collator,
            run.max_tokens_in_batch,
            run.max_segment_len,
        )
        .with_max_doc_len(TRAIN_MAX_DOC_LEN);
        let student_batches = create_batches(&student_sampler).shuffle(run.training.seed);
        info!("Student batches: {student_batches}");

        let teacher_collator = teacher
            .as_ref()
            .map(|t| LongDocCollator::new(&tokenizer, t.max_sequence_length()));
        let teacher_batches = teacher_collator.as_ref().map(|collator| {
            let sampler = DynamicBatchSampler::new(
                train_docs,
                collator,
                run.max_tokens_in_batch,
                run.max_segment_len,
            )
            .with_max_doc_len(TRAIN_MAX_DOC_LEN);
            create_batches(&sampler).shuffle(run.training.seed)
        });
        if let Some(batches) = &teacher_batches {
            info!("Teacher batches: {batches}");
        }

        let teacher_arg = teacher
            .as_ref()
            .zip(teacher_batches.as_ref())
            .map(|(model, batches)| Teacher { model, batches });

        let (steps, average_loss) = train(
            &run.training,
            &student_batches,
            teacher_arg,
            &student,
            &evaluator,
            tracker.as_mut(),
        )?;
        info!(global_step = steps, average_loss, "Training finished");
        global_step = steps;
    }

    // ── Evaluation ────────────────────────────────────────────────────────────
    let evaluation = evaluator.evaluate(&student)?;
    evaluator.write(&evaluation)?;

    if let Some(mut t) = tracker {
        let r = &evaluation.results;
        t.log_metrics(
            global_step,
            &[
                ("final_eval_loss", r.loss),
                ("final_muc_f1", r.muc.f1),
                ("final_b_cubed_f1", r.b_cubed.f1),
                ("final_ceafe_f1", r.ceafe.f1),
                ("final_conll_f1", r.conll_f1),
            ],
        )?;
        t.finish(RunStatus::Completed)?;
    }

    Ok(evaluation.results)
}

/// Load a model, reject unsupported architectures, and log its loading
/// info and size.
fn get_model(
    model_dir: &Path,
    role: ModelRole,
    head: &HeadConfig,
    seed: u64,
    device: &Device,
) -> Result<CorefModel> {
    let (model, loading) = CorefModel::load(model_dir, role, head, seed, device)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;

    info!(loaded = loading.loaded, "loaded_keys");
    info!(keys = ?loading.missing_keys, "missing_keys");
    info!(keys = ?loading.unexpected_keys, "unexpected_keys");

    let (t_params, h_params) = model.num_parameters();
    info!(
        "Parameters: {:.1}M, Transformer: {:.1}M, Head: {:.1}M",
        t_params + h_params,
        t_params,
        h_params
    );
    Ok(model)
}

fn resolve_device(flag: Option<&str>, config: &AppConfig) -> Result<Device> {
    let device = match flag {
        Some(raw) => select_device_spec(DeviceSpec::from_str(raw)?)?,
        None => select_device(config.device.prefer_gpu, config.device.cuda_device_id)?,
    };
    Ok(device)
}
