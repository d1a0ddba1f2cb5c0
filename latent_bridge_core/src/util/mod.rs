use std::fmt::Display;
use std::path::PathBuf;

use candle_core::{DType, Device};
use serde::Deserialize;
use tracing::info;

/// DType to run the models in.
///
/// `Auto` picks BF16 on accelerators and F32 on CPU.
#[derive(Clone, Copy, Default, Debug, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Bf16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

impl ModelDType {
    pub fn resolve(&self, device: &Device) -> DType {
        let dtype = match self {
            Self::Auto => {
                if device.is_cuda() || device.is_metal() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        info!("dtype selected is {dtype:?}.");
        dtype
    }
}

/// Fetch a single file from a Hugging Face Hub model repo, using the local
/// cache when present.
pub fn hub_file(repo_id: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new()?;
    Ok(api.model(repo_id.to_string()).get(filename)?)
}

/// Pick the best available device: CUDA if compiled in and present, Metal
/// when built with the `metal` feature, CPU otherwise.
pub fn best_device() -> candle_core::Result<Device> {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0)
    }
    #[cfg(not(feature = "metal"))]
    {
        Device::cuda_if_available(0)
    }
}
