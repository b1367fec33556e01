use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::{
    clusters::{best_antecedents, build_clusters, Cluster},
    encoder::{Encoder, EncoderConfig},
    error::{CoreError, CoreResult},
    head::{CorefHead, CorefScores, HeadConfig, MentionSpans},
};

/// Prefix under which the coreference head stores its weights.
pub const HEAD_PREFIX: &str = "coref_head";

const WEIGHTS_FILE: &str = "model.safetensors";
const HEAD_CONFIG_FILE: &str = "coref_config.json";

/// How a loaded model is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// Weights live in a [`VarMap`] and receive gradients.
    Trainable,
    /// Weights are constants; head outputs are detached from the graph.
    Frozen,
}

/// What happened when checkpoint weights were matched against the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingInfo {
    pub loaded: usize,
    /// Model parameters absent from the checkpoint (left at their init).
    pub missing_keys: Vec<String>,
    /// Checkpoint tensors the model has no parameter for.
    pub unexpected_keys: Vec<String>,
}

/// One collated batch ready for the encoder.
///
/// The encoder sees `[rows, seq_len]` windows; `gather_index` maps every
/// document-token position `(doc, t)` (flattened as `doc * max_doc_len + t`)
/// to a row-token position in the flattened `[rows * seq_len]` encoder
/// output.  Positions past a document's end point at a padding slot.
#[derive(Debug, Clone)]
pub struct EncoderInput {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub gather_index: Tensor,
    pub doc_lens: Vec<usize>,
}

impl EncoderInput {
    pub fn num_docs(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn max_doc_len(&self) -> usize {
        self.doc_lens.iter().copied().max().unwrap_or(0)
    }
}

/// Encoder plus coreference head.
pub struct CorefModel {
    encoder: Encoder,
    head: CorefHead,
    varmap: VarMap,
    encoder_config: EncoderConfig,
    head_config: HeadConfig,
    role: ModelRole,
    seed: u64,
    device: Device,
}

impl CorefModel {
    /// A randomly initialised trainable model.
    ///
    /// `seed` fixes both the initial weights and the dropout masks.
    pub fn init(
        encoder_config: EncoderConfig,
        head_config: HeadConfig,
        seed: u64,
        device: &Device,
    ) -> CoreResult<Self> {
        encoder_config.ensure_supported()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = Encoder::load(vb.pp(&encoder_config.model_type), &encoder_config, true)?;
        let head = CorefHead::new(
            vb.pp(HEAD_PREFIX),
            encoder_config.hidden_size,
            &head_config,
            seed,
        )?;
        seeded_init(&varmap, seed, encoder_config.initializer_range)?;
        Ok(Self {
            encoder,
            head,
            varmap,
            encoder_config,
            head_config,
            role: ModelRole::Trainable,
            seed,
            device: device.clone(),
        })
    }

    /// Load a model directory (`config.json` plus safetensors weights).
    ///
    /// `coref_config.json`, when present, overrides `head_defaults`.  A frozen
    /// model must find every parameter in the checkpoint, head included; a
    /// trainable one initialises missing parameters from `seed`.
    pub fn load(
        model_dir: &Path,
        role: ModelRole,
        head_defaults: &HeadConfig,
        seed: u64,
        device: &Device,
    ) -> CoreResult<(Self, LoadingInfo)> {
        info!(model_dir = %model_dir.display(), ?role, "Loading coreference model");

        let encoder_config = EncoderConfig::from_model_dir(model_dir)?;
        encoder_config.ensure_supported()?;
        let head_config = read_head_config(model_dir)?.unwrap_or_else(|| head_defaults.clone());
        debug!(?head_config, "Resolved head config");

        let mut model = Self::init(encoder_config, head_config, seed, device)?;
        let checkpoint = load_checkpoint(model_dir, &model.encoder_config.model_type, device)?;
        let info = model.apply_checkpoint(checkpoint)?;

        if !info.missing_keys.is_empty() {
            match role {
                ModelRole::Frozen => {
                    return Err(CoreError::IncompleteCheckpoint {
                        path: model_dir.display().to_string(),
                        reason: format!(
                            "{} parameters missing, e.g. {}",
                            info.missing_keys.len(),
                            info.missing_keys[0]
                        ),
                    })
                }
                ModelRole::Trainable => warn!(
                    missing = info.missing_keys.len(),
                    "Some parameters were not in the checkpoint and keep their random init"
                ),
            }
        }

        if role == ModelRole::Frozen {
            model.freeze()?;
        }
        Ok((model, info))
    }

    fn apply_checkpoint(
        &mut self,
        mut checkpoint: HashMap<String, Tensor>,
    ) -> CoreResult<LoadingInfo> {
        let mut info = LoadingInfo::default();
        {
            let data = lock_vars(&self.varmap)?;
            let mut names: Vec<&String> = data.keys().collect();
            names.sort();
            for name in names {
                let var = &data[name];
                match checkpoint.remove(name) {
                    Some(tensor) if tensor.dims() == var.dims() => {
                        var.set(&tensor.to_dtype(var.dtype())?)?;
                        info.loaded += 1;
                    }
                    Some(tensor) => {
                        return Err(CoreError::IncompleteCheckpoint {
                            path: name.clone(),
                            reason: format!(
                                "shape mismatch: checkpoint {:?}, model {:?}",
                                tensor.dims(),
                                var.dims()
                            ),
                        })
                    }
                    None => info.missing_keys.push(name.clone()),
                }
            }
        }
        info.unexpected_keys = checkpoint.into_keys().collect();
        info.unexpected_keys.sort();
        Ok(info)
    }

    /// Rebuild on detached constants so no computation records gradients.
    fn freeze(&mut self) -> CoreResult<()> {
        let tensors: HashMap<String, Tensor> = {
            let data = lock_vars(&self.varmap)?;
            data.iter().map(|(k, v)| (k.clone(), v.as_detached_tensor())).collect()
        };
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &self.device);
        self.encoder = Encoder::load(
            vb.pp(&self.encoder_config.model_type),
            &self.encoder_config,
            false,
        )?;
        self.head = CorefHead::new(
            vb.pp(HEAD_PREFIX),
            self.encoder_config.hidden_size,
            &self.head_config,
            self.seed,
        )?;
        self.role = ModelRole::Frozen;
        Ok(())
    }

    /// Run the encoder and gather its output into document space,
    /// `[docs, max_doc_len, hidden]`.
    pub fn encode(&self, input: &EncoderInput) -> CoreResult<Tensor> {
        let seq = self.encoder.forward(&input.input_ids, &input.attention_mask)?;
        let (rows, seq_len, hidden) = seq.dims3()?;
        let docs = seq
            .reshape((rows * seq_len, hidden))?
            .index_select(&input.gather_index, 0)?
            .reshape((input.num_docs(), input.max_doc_len(), hidden))?;
        Ok(docs)
    }

    pub fn propose(&self, hidden: &Tensor, doc_lens: &[usize]) -> CoreResult<MentionSpans> {
        self.head.propose(hidden, doc_lens)
    }

    pub fn score(
        &self,
        hidden: &Tensor,
        spans: &MentionSpans,
        train: bool,
    ) -> CoreResult<CorefScores> {
        match self.role {
            ModelRole::Trainable => self.head.score(hidden, spans, train),
            ModelRole::Frozen => Ok(self.head.score(hidden, spans, false)?.detach()),
        }
    }

    /// Predicted clusters per document, in subword offsets.
    pub fn predict(&self, input: &EncoderInput) -> CoreResult<Vec<Vec<Cluster>>> {
        let hidden = self.encode(input)?;
        let spans = self.propose(&hidden, &input.doc_lens)?;
        let scores = self.score(&hidden, &spans, false)?;
        decode_clusters(&spans, &scores)
    }

    /// Parameter counts in millions: `(encoder, head)`.
    pub fn num_parameters(&self) -> (f64, f64) {
        let mut encoder = 0usize;
        let mut head = 0usize;
        if let Ok(data) = self.varmap.data().lock() {
            for (name, var) in data.iter() {
                if name.starts_with(HEAD_PREFIX) {
                    head += var.elem_count();
                } else {
                    encoder += var.elem_count();
                }
            }
        }
        (encoder as f64 / 1e6, head as f64 / 1e6)
    }

    /// Trainable variables split into `(encoder, head)` groups.
    pub fn trainable_vars(&self) -> CoreResult<(Vec<Var>, Vec<Var>)> {
        if self.role != ModelRole::Trainable {
            return Err(CoreError::Config {
                field: "role".to_string(),
                reason: "a frozen model has no trainable parameters".to_string(),
            });
        }
        let data = lock_vars(&self.varmap)?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        let (head, encoder): (Vec<&String>, Vec<&String>) =
            names.into_iter().partition(|n| n.starts_with(HEAD_PREFIX));
        Ok((
            encoder.into_iter().map(|n| data[n].clone()).collect(),
            head.into_iter().map(|n| data[n].clone()).collect(),
        ))
    }

    /// Write weights and configs into `dir`, optionally copying the tokenizer.
    pub fn save(&self, dir: &Path, tokenizer_file: Option<&Path>) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(&self.encoder_config.raw)?,
        )?;
        std::fs::write(
            dir.join(HEAD_CONFIG_FILE),
            serde_json::to_string_pretty(&self.head_config)?,
        )?;
        if let Some(src) = tokenizer_file {
            let dst = dir.join("tokenizer.json");
            if !dst.exists() || std::fs::canonicalize(src)? != std::fs::canonicalize(&dst)? {
                std::fs::copy(src, dst)?;
            }
        }
        info!(dir = %dir.display(), "Model saved");
        Ok(())
    }

    pub fn role(&self) -> ModelRole {
        self.role
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn head_config(&self) -> &HeadConfig {
        &self.head_config
    }

    /// Longest encoder row, special tokens included.
    pub fn max_sequence_length(&self) -> usize {
        self.encoder_config.max_sequence_length()
    }
}

/// Greedy antecedent decoding of already computed scores, one cluster list
/// per document in subword offsets.
pub fn decode_clusters(
    spans: &MentionSpans,
    scores: &CorefScores,
) -> CoreResult<Vec<Vec<Cluster>>> {
    let logits = scores.coref_logits.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    Ok((0..spans.num_docs())
        .map(|doc| {
            let n = spans.num_valid[doc];
            let list: Vec<(usize, usize)> = (0..n)
                .map(|i| (spans.starts[doc][i], spans.ends[doc][i]))
                .collect();
            let antecedents = best_antecedents(&logits[doc], n);
            build_clusters(&list, &antecedents)
        })
        .collect())
}

fn lock_vars(varmap: &VarMap) -> CoreResult<MutexGuard<'_, HashMap<String, Var>>> {
    varmap.data().lock().map_err(|_| CoreError::Config {
        field: "varmap".to_string(),
        reason: "parameter store lock poisoned".to_string(),
    })
}

/// Draw every parameter from a host RNG seeded with `seed`: layer-norm scales
/// start at one, biases at zero, everything else uniform with standard
/// deviation `std`.
fn seeded_init(varmap: &VarMap, seed: u64, std: f64) -> CoreResult<()> {
    let data = lock_vars(varmap)?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let bound = (std * 3f64.sqrt()) as f32;
    let uniform = Uniform::new_inclusive(-bound, bound);
    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let n = var.elem_count();
        let values: Vec<f32> = if name.ends_with("LayerNorm.weight") {
            vec![1.0; n]
        } else if name.ends_with(".bias") {
            vec![0.0; n]
        } else {
            (0..n).map(|_| uniform.sample(&mut rng)).collect()
        };
        let init = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&init)?;
    }
    Ok(())
}

fn read_head_config(model_dir: &Path) -> CoreResult<Option<HeadConfig>> {
    let path = model_dir.join(HEAD_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&json)?))
}

/// Safetensors files making up a checkpoint, sharded or single.
pub fn weight_files(model_dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = model_dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect::<std::collections::HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        shards.sort();
        return Ok(shards.iter().map(|s| model_dir.join(s)).collect());
    }

    let single = model_dir.join(WEIGHTS_FILE);
    if single.exists() {
        return Ok(vec![single]);
    }

    Err(CoreError::Config {
        field: "model_dir".to_string(),
        reason: format!("No safetensors weights found in {}", model_dir.display()),
    })
}

fn load_checkpoint(
    model_dir: &Path,
    encoder_prefix: &str,
    device: &Device,
) -> CoreResult<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for file in weight_files(model_dir)? {
        debug!(file = %file.display(), "Reading weights");
        for (name, tensor) in candle_core::safetensors::load(&file, device)? {
            tensors.insert(normalize_key(&name, encoder_prefix), tensor);
        }
    }
    Ok(tensors)
}

/// Put bare encoder checkpoints under the encoder prefix and map legacy
/// `gamma`/`beta` layer-norm names to `weight`/`bias`.
fn normalize_key(name: &str, encoder_prefix: &str) -> String {
    let name = if name.starts_with("embeddings.") || name.starts_with("encoder.") {
        format!("{encoder_prefix}.{name}")
    } else {
        name.to_string()
    };
    if name.contains("LayerNorm.") {
        if let Some(stem) = name.strip_suffix(".gamma") {
            return format!("{stem}.weight");
        }
        if let Some(stem) = name.strip_suffix(".beta") {
            return format!("{stem}.bias");
        }
    }
    name
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::encoder::test_support::tiny_bert_config;

    pub fn tiny_head_config() -> HeadConfig {
        HeadConfig { ffnn_size: 8, max_span_length: 3, top_lambda: 0.5, dropout_prob: 0.0 }
    }

    /// Save a random tiny model (with head weights) into `dir`.
    pub fn write_tiny_model(dir: &Path, vocab_size: usize) -> CorefModel {
        let cfg = EncoderConfig::from_json(&tiny_bert_config(vocab_size, 8).to_string()).unwrap();
        let model = CorefModel::init(cfg, tiny_head_config(), 0, &Device::Cpu).unwrap();
        model.save(dir, None).unwrap();
        model
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    fn input() -> EncoderInput {
        let dev = Device::Cpu;
        // two rows of length 4: doc 0 = 3 tokens in row 0, doc 1 = 2 tokens in row 1
        EncoderInput {
            input_ids: Tensor::new(&[[2u32, 4, 5, 6], [2, 7, 8, 3]], &dev).unwrap(),
            attention_mask: Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 1]], &dev).unwrap(),
            gather_index: Tensor::new(&[1u32, 2, 3, 5, 6, 0], &dev).unwrap(),
            doc_lens: vec![3, 2],
        }
    }

    #[test]
    fn normalizes_bare_and_legacy_keys() {
        assert_eq!(
            normalize_key("embeddings.word_embeddings.weight", "bert"),
            "bert.embeddings.word_embeddings.weight"
        );
        assert_eq!(
            normalize_key("bert.encoder.layer.0.output.LayerNorm.gamma", "bert"),
            "bert.encoder.layer.0.output.LayerNorm.weight"
        );
        assert_eq!(
            normalize_key("coref_head.start_scorer.bias", "bert"),
            "coref_head.start_scorer.bias"
        );
    }

    #[test]
    fn save_then_load_round_trips_weights() {
        let dir = TempDir::new().unwrap();
        let original = write_tiny_model(dir.path(), 10);
        let (loaded, info) = CorefModel::load(
            dir.path(),
            ModelRole::Trainable,
            &HeadConfig::default(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        assert!(info.missing_keys.is_empty());
        assert!(info.unexpected_keys.is_empty());
        // coref_config.json wins over the defaults passed in
        assert_eq!(loaded.head_config(), original.head_config());
        assert_eq!(loaded.num_parameters(), original.num_parameters());
    }

    #[test]
    fn frozen_load_requires_head_weights() {
        let dir = TempDir::new().unwrap();
        let cfg = EncoderConfig::from_json(
            &crate::encoder::test_support::tiny_bert_config(10, 8).to_string(),
        )
        .unwrap();
        let model = CorefModel::init(cfg, tiny_head_config(), 0, &Device::Cpu).unwrap();
        model.save(dir.path(), None).unwrap();

        // Strip the head from the checkpoint.
        let path = dir.path().join(WEIGHTS_FILE);
        let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(&path, &Device::Cpu)
            .unwrap()
            .into_iter()
            .filter(|(k, _)| !k.starts_with(HEAD_PREFIX))
            .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let result = CorefModel::load(
            dir.path(),
            ModelRole::Frozen,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        );
        assert!(matches!(result, Err(CoreError::IncompleteCheckpoint { .. })));

        let (student, info) = CorefModel::load(
            dir.path(),
            ModelRole::Trainable,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        assert!(info.missing_keys.iter().all(|k| k.starts_with(HEAD_PREFIX)));
        assert_eq!(student.role(), ModelRole::Trainable);
    }

    #[test]
    fn encode_gathers_document_tokens() {
        let dir = TempDir::new().unwrap();
        write_tiny_model(dir.path(), 10);
        let (model, _) = CorefModel::load(
            dir.path(),
            ModelRole::Trainable,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        let hidden = model.encode(&input()).unwrap();
        assert_eq!(hidden.dims(), &[2, 3, 8]);
    }

    #[test]
    fn frozen_and_trainable_encoders_agree() {
        let dir = TempDir::new().unwrap();
        write_tiny_model(dir.path(), 10);
        let (student, _) = CorefModel::load(
            dir.path(),
            ModelRole::Trainable,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        let (teacher, _) = CorefModel::load(
            dir.path(),
            ModelRole::Frozen,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        let a = student.encode(&input()).unwrap();
        let b = teacher.encode(&input()).unwrap();
        let diff = a.sub(&b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-3, "encoders diverge by {diff}");
    }

    #[test]
    fn frozen_model_has_no_trainable_vars() {
        let dir = TempDir::new().unwrap();
        write_tiny_model(dir.path(), 10);
        let (teacher, _) = CorefModel::load(
            dir.path(),
            ModelRole::Frozen,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        assert!(teacher.trainable_vars().is_err());
    }

    #[test]
    fn predict_returns_one_cluster_list_per_document() {
        let dir = TempDir::new().unwrap();
        write_tiny_model(dir.path(), 10);
        let (model, _) = CorefModel::load(
            dir.path(),
            ModelRole::Trainable,
            &tiny_head_config(),
            0,
            &Device::Cpu,
        )
        .unwrap();
        let clusters = model.predict(&input()).unwrap();
        assert_eq!(clusters.len(), 2);
        for doc in &clusters {
            for cluster in doc {
                assert!(cluster.len() >= 2);
            }
        }
    }

    #[test]
    fn missing_weights_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(weight_files(dir.path()), Err(CoreError::Config { .. })));
    }
}
