//! CLIP text encoder used to produce prompt conditionings.
//!
//! The transformer mirrors the Hugging Face `CLIPTextModel` layout so that
//! `text_encoder/` weights from a diffusers checkpoint load directly. The
//! config is deserialized from the checkpoint's `config.json`.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use super::EmbeddingAndMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipActivation {
    QuickGelu,
    Gelu,
    GeluErf,
}

impl Module for ClipActivation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Self::Gelu => xs.gelu(),
            Self::GeluErf => xs.gelu_erf(),
        }
    }
}

fn default_act() -> ClipActivation {
    ClipActivation::QuickGelu
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_act")]
    pub hidden_act: ClipActivation,
}

#[derive(Debug)]
struct TextEmbeddings {
    token_embedding: candle_nn::Embedding,
    position_embedding: candle_nn::Embedding,
    position_ids: Tensor,
}

impl TextEmbeddings {
    fn new(cfg: &ClipConfig, vb: VarBuilder) -> Result<Self> {
        let token_embedding =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("token_embedding"))?;
        let position_embedding = candle_nn::embedding(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position_embedding"),
        )?;
        let position_ids =
            Tensor::arange(0u32, cfg.max_position_embeddings as u32, vb.device())?.unsqueeze(0)?;
        Ok(Self {
            token_embedding,
            position_embedding,
            position_ids,
        })
    }
}

impl Module for TextEmbeddings {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(D::Minus1)?;
        let positions = self.position_ids.i((.., ..seq_len))?;
        self.token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: candle_nn::Linear,
    k_proj: candle_nn::Linear,
    v_proj: candle_nn::Linear,
    out_proj: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &ClipConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.hidden_size;
        let q_proj = candle_nn::linear(dim, dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(dim, dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(dim, dim, vb.pp("v_proj"))?;
        let out_proj = candle_nn::linear(dim, dim, vb.pp("out_proj"))?;
        let num_heads = cfg.num_attention_heads;
        let head_dim = dim / num_heads;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor, bsz: usize, seq_len: usize) -> Result<Tensor> {
        xs.reshape((bsz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let in_dtype = xs.dtype();
        let (bsz, seq_len, dim) = xs.dims3()?;
        let q = (self.q_proj.forward(xs)? * self.scale)?;
        let q = self
            .split_heads(&q, bsz, seq_len)?
            .to_dtype(DType::F32)?;
        let k = self
            .split_heads(&self.k_proj.forward(xs)?, bsz, seq_len)?
            .to_dtype(DType::F32)?;
        let v = self
            .split_heads(&self.v_proj.forward(xs)?, bsz, seq_len)?
            .to_dtype(DType::F32)?;

        let attn = q.matmul(&k.transpose(D::Minus2, D::Minus1)?)?;
        let attn = attn.broadcast_add(causal_mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn
            .matmul(&v)?
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, dim))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: candle_nn::Linear,
    fc2: candle_nn::Linear,
    act: ClipActivation,
}

impl Mlp {
    fn new(cfg: &ClipConfig, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            act: cfg.hidden_act,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.apply(&self.act)?.apply(&self.fc2)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: Attention,
    layer_norm1: candle_nn::LayerNorm,
    mlp: Mlp,
    layer_norm2: candle_nn::LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &ClipConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm1: candle_nn::layer_norm(cfg.hidden_size, 1e-5, vb.pp("layer_norm1"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            layer_norm2: candle_nn::layer_norm(cfg.hidden_size, 1e-5, vb.pp("layer_norm2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = (self.self_attn.forward(&xs, causal_mask)? + residual)?;
        let residual = &xs;
        let out = xs.apply(&self.layer_norm2)?.apply(&self.mlp)?;
        out + residual
    }
}

/// The text half of a CLIP model, producing per-token hidden states.
#[derive(Debug)]
pub struct ClipTextTransformer {
    embeddings: TextEmbeddings,
    layers: Vec<EncoderLayer>,
    final_layer_norm: candle_nn::LayerNorm,
    device: Device,
}

impl ClipTextTransformer {
    pub fn new(cfg: &ClipConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let embeddings = TextEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_l = vb.pp("encoder.layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for index in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::new(cfg, vb_l.pp(index))?);
        }
        let final_layer_norm =
            candle_nn::layer_norm(cfg.hidden_size, 1e-5, vb.pp("final_layer_norm"))?;
        Ok(Self {
            embeddings,
            layers,
            final_layer_norm,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::MIN } else { 0. }))
            .collect();
        // (1, 1, s, s), broadcast over batch and heads.
        Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)
    }
}

impl Module for ClipTextTransformer {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_bsz, seq_len) = input_ids.dims2()?;
        let causal_mask = Self::causal_mask(seq_len, input_ids.device())?;
        let mut xs = self.embeddings.forward(input_ids)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &causal_mask)?;
        }
        xs.apply(&self.final_layer_norm)
    }
}

/// Pad each tokenization to the longest one in the batch.
///
/// Returns the padded ids together with a 0/1 mask marking real tokens.
pub(crate) fn pad_and_mask(token_ids: Vec<Vec<u32>>, pad_id: u32) -> (Vec<Vec<u32>>, Vec<Vec<u32>>) {
    let max_len = token_ids.iter().map(|t| t.len()).max().unwrap_or(0);
    let mut padded = Vec::with_capacity(token_ids.len());
    let mut masks = Vec::with_capacity(token_ids.len());
    for mut ids in token_ids {
        let mut mask = vec![1u32; ids.len()];
        mask.resize(max_len, 0);
        ids.resize(max_len, pad_id);
        padded.push(ids);
        masks.push(mask);
    }
    (padded, masks)
}

/// Tokenizer + text model pair implementing the embedding contract used by
/// [`CondBatcher`](super::CondBatcher).
pub struct ClipEmbedder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
}

impl ClipEmbedder {
    pub fn new(tokenizer: Tokenizer, model: ClipTextTransformer, pad_id: u32) -> Self {
        Self {
            tokenizer,
            model,
            pad_id,
        }
    }

    /// Load the text encoder from a diffusers-style checkpoint directory pair:
    /// `tokenizer.json` plus the text encoder's `config.json` and safetensors.
    pub fn load<P: AsRef<Path>>(
        tokenizer_file: P,
        config_file: P,
        weight_files: &[std::path::PathBuf],
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file.as_ref()).map_err(anyhow::Error::msg)?;
        let cfg: ClipConfig = serde_json::from_str(&std::fs::read_to_string(config_file)?)?;
        info!("loading CLIP text model ({} layers)", cfg.num_hidden_layers);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, dtype, device)? };
        let model = ClipTextTransformer::new(&cfg, vb.pp("text_model"))?;
        Ok(Self::new(tokenizer, model, 0))
    }

    /// Embed one chunk of prompts, returning the hidden states and the
    /// attention mask derived from tokenization.
    pub fn embed(&self, prompts: &[String]) -> Result<EmbeddingAndMask> {
        let encodings = self
            .tokenizer
            .encode_batch(prompts.to_vec(), true)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let token_ids = encodings
            .into_iter()
            .map(|e| e.get_ids().to_vec())
            .collect::<Vec<_>>();
        let (padded, masks) = pad_and_mask(token_ids, self.pad_id);

        let device = self.model.device();
        let input_ids = Tensor::new(padded, device)?;
        let embedding = self.model.forward(&input_ids)?;
        let mask = Tensor::new(masks, device)?;
        Ok(EmbeddingAndMask { embedding, mask })
    }
}
