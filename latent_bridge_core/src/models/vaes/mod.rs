use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::info;

mod autoencoder_kl;
mod decoder;

pub use autoencoder_kl::{AutoencoderKl, AutoencoderKlConfig};

/// A variational autoencoder seen from the decoding side.
pub trait VaeModel: Send + Sync + std::fmt::Debug {
    /// Decode latents to pixel space in `[-1, 1]`.
    ///
    /// This does *not* rescale the input. Callers apply
    /// `latents / scale_factor + shift_factor` exactly once beforehand.
    fn decode(&self, xs: &Tensor) -> Result<Tensor>;

    fn scale_factor(&self) -> f64;

    fn shift_factor(&self) -> f64;
}

#[derive(Debug, Clone, Deserialize)]
struct VaeClassShim {
    #[serde(rename = "_class_name")]
    name: String,
}

/// Load a VAE from a diffusers `config.json` plus safetensors, dispatching on
/// the config's `_class_name`.
pub fn load_vae<P: AsRef<Path>>(
    config_file: P,
    weight_files: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<Arc<dyn VaeModel>> {
    let raw = std::fs::read_to_string(config_file)?;
    let VaeClassShim { name } = serde_json::from_str(&raw)?;
    match name.as_str() {
        "AutoencoderKL" => {
            let cfg: AutoencoderKlConfig = serde_json::from_str(&raw)?;
            info!(
                "loading AutoencoderKL (latent_channels={}, scaling_factor={})",
                cfg.latent_channels, cfg.scaling_factor
            );
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, dtype, device)? };
            Ok(Arc::new(AutoencoderKl::new(&cfg, vb)?))
        }
        other => anyhow::bail!("unexpected VAE class `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_shim_parses() -> anyhow::Result<()> {
        let shim: VaeClassShim =
            serde_json::from_str(r#"{"_class_name": "AutoencoderKL", "latent_channels": 4}"#)?;
        assert_eq!(shim.name, "AutoencoderKL");
        Ok(())
    }

    #[test]
    fn unknown_class_is_rejected() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join("latent_bridge_vae_shim_test");
        std::fs::create_dir_all(&dir)?;
        let config = dir.join("config.json");
        std::fs::write(&config, r#"{"_class_name": "AutoencoderTiny"}"#)?;
        let err = load_vae(&config, &[], DType::F32, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("AutoencoderTiny"));
        Ok(())
    }
}
