//! BERT written with plain tensor ops.
//!
//! candle's fused `layer_norm` kernel has no backward pass, so a BERT built
//! from `candle_transformers` cuts the autograd graph after every layer.  A
//! student whose transformer has to learn runs this implementation instead.
//! Parameter names follow the Hugging Face checkpoint layout, so the same
//! weights load into either implementation.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Init, Linear, VarBuilder};
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Added to attention scores of padding keys.
const MASKED_ATTENTION: f64 = -1e4;

/// `config.json` fields the encoder is built from.
#[derive(Debug, Clone, Deserialize)]
pub struct BertParams {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    /// Exact (erf) GELU, what Hugging Face calls `gelu`.
    Gelu,
    /// tanh approximation.
    GeluTanh,
    Relu,
}

impl Activation {
    fn parse(name: &str) -> CoreResult<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_approximate" => Ok(Self::GeluTanh),
            "relu" => Ok(Self::Relu),
            other => Err(CoreError::Config {
                field: "hidden_act".to_string(),
                reason: format!("unsupported activation '{other}'"),
            }),
        }
    }

    fn apply(self, xs: &Tensor) -> CoreResult<Tensor> {
        Ok(match self {
            Self::Gelu => xs.gelu_erf()?,
            Self::GeluTanh => xs.gelu()?,
            Self::Relu => xs.relu()?,
        })
    }
}

/// Layer normalisation over the last dimension, composed from ops that all
/// have gradients.
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> CoreResult<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> CoreResult<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&variance.affine(1.0, self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

struct Embeddings {
    word: Embedding,
    position: Embedding,
    token_type: Embedding,
    norm: LayerNorm,
}

impl Embeddings {
    fn new(params: &BertParams, vb: VarBuilder) -> CoreResult<Self> {
        let h = params.hidden_size;
        Ok(Self {
            word: embedding(params.vocab_size, h, vb.pp("word_embeddings"))?,
            position: embedding(params.max_position_embeddings, h, vb.pp("position_embeddings"))?,
            token_type: embedding(params.type_vocab_size, h, vb.pp("token_type_embeddings"))?,
            norm: LayerNorm::new(h, params.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> CoreResult<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let token_types = input_ids.zeros_like()?;
        let xs = self
            .word
            .forward(input_ids)?
            .add(&self.token_type.forward(&token_types)?)?
            .broadcast_add(&self.position.forward(&positions)?)?;
        self.norm.forward(&xs)
    }
}

struct Layer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_out: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    activation: Activation,
}

impl Layer {
    fn new(params: &BertParams, activation: Activation, vb: VarBuilder) -> CoreResult<Self> {
        let h = params.hidden_size;
        if params.num_attention_heads == 0 || h % params.num_attention_heads != 0 {
            return Err(CoreError::Config {
                field: "num_attention_heads".to_string(),
                reason: format!(
                    "{} heads do not divide hidden size {h}",
                    params.num_attention_heads
                ),
            });
        }
        let attention = vb.pp("attention");
        let eps = params.layer_norm_eps;
        Ok(Self {
            query: linear(h, h, attention.pp("self").pp("query"))?,
            key: linear(h, h, attention.pp("self").pp("key"))?,
            value: linear(h, h, attention.pp("self").pp("value"))?,
            attention_out: linear(h, h, attention.pp("output").pp("dense"))?,
            attention_norm: LayerNorm::new(h, eps, attention.pp("output").pp("LayerNorm"))?,
            intermediate: linear(h, params.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(params.intermediate_size, h, vb.pp("output").pp("dense"))?,
            output_norm: LayerNorm::new(h, eps, vb.pp("output").pp("LayerNorm"))?,
            num_heads: params.num_attention_heads,
            head_dim: h / params.num_attention_heads,
            activation,
        })
    }

    /// `mask` is additive, `[rows, 1, 1, seq_len]`.
    fn forward(&self, xs: &Tensor, mask: &Tensor) -> CoreResult<Tensor> {
        let (rows, seq_len, hidden) = xs.dims3()?;
        let split_heads = |layer: &Linear| -> CoreResult<Tensor> {
            Ok(layer
                .forward(xs)?
                .reshape((rows, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(&self.query)?;
        let k = split_heads(&self.key)?;
        let v = split_heads(&self.value)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((rows, seq_len, hidden))?;

        let attended = self
            .attention_norm
            .forward(&self.attention_out.forward(&context)?.add(xs)?)?;
        let inner = self.activation.apply(&self.intermediate.forward(&attended)?)?;
        self.output_norm.forward(&self.output.forward(&inner)?.add(&attended)?)
    }
}

/// A BERT encoder whose every parameter receives gradients.
pub struct BertEncoder {
    embeddings: Embeddings,
    layers: Vec<Layer>,
}

impl BertEncoder {
    pub fn load(vb: VarBuilder, params: &BertParams) -> CoreResult<Self> {
        let activation = Activation::parse(&params.hidden_act)?;
        let embeddings = Embeddings::new(params, vb.pp("embeddings"))?;
        let layers = (0..params.num_hidden_layers)
            .map(|i| Layer::new(params, activation, vb.pp("encoder").pp("layer").pp(i)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// `[rows, seq_len]` u32 ids and mask to `[rows, seq_len, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> CoreResult<Tensor> {
        let (rows, seq_len) = input_ids.dims2()?;
        let mask = attention_mask
            .to_dtype(DType::F32)?
            .affine(-MASKED_ATTENTION, MASKED_ATTENTION)?
            .reshape((rows, 1, 1, seq_len))?;
        let mut xs = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask)?;
        }
        Ok(xs)
    }
}
