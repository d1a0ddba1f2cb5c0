//! Approximate latent decoder.
//!
//! A per-pixel MLP trained to map latent channels straight to RGB, cheap
//! enough for previews. It runs channels-last: callers feed `(b, h, w, c)`
//! and get `(b, h, w, 3)` in roughly `[-1, 1]`.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::Deserialize;
use tracing::info;

fn default_latent_channels() -> usize {
    4
}

fn default_hidden_size() -> usize {
    64
}

fn default_out_channels() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproxDecoderConfig {
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,
}

impl Default for ApproxDecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: default_latent_channels(),
            hidden_size: default_hidden_size(),
            out_channels: default_out_channels(),
        }
    }
}

#[derive(Debug)]
pub struct ApproxDecoder {
    proj_in: Linear,
    proj_out: Linear,
}

impl ApproxDecoder {
    pub fn new(cfg: &ApproxDecoderConfig, vb: VarBuilder) -> Result<Self> {
        let proj_in = candle_nn::linear(cfg.latent_channels, cfg.hidden_size, vb.pp("proj_in"))?;
        let proj_out = candle_nn::linear(cfg.hidden_size, cfg.out_channels, vb.pp("proj_out"))?;
        Ok(Self { proj_in, proj_out })
    }

    pub fn load<P: AsRef<Path>>(
        config_file: Option<P>,
        weight_files: &[PathBuf],
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let cfg = match config_file {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => ApproxDecoderConfig::default(),
        };
        info!(
            "loading approx decoder ({} -> {} -> {})",
            cfg.latent_channels, cfg.hidden_size, cfg.out_channels
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, dtype, device)? };
        Ok(Self::new(&cfg, vb)?)
    }
}

impl Module for ApproxDecoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.proj_in)?.silu()?.apply(&self.proj_out)
    }
}
