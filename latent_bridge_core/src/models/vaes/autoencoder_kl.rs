use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, VarBuilder};
use serde::Deserialize;

use super::{decoder::Decoder, VaeModel};

fn default_act() -> Activation {
    Activation::Silu
}

// The SD 1.x factor; older configs omit the field.
fn default_scaling_factor() -> f64 {
    0.18215
}

fn default_true() -> bool {
    true
}

/// Subset of the diffusers `AutoencoderKL` `config.json` needed for decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoencoderKlConfig {
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    #[serde(default = "default_act")]
    pub act_fn: Activation,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
    #[serde(default)]
    pub shift_factor: Option<f64>,
    #[serde(default = "default_true")]
    pub mid_block_add_attention: bool,
    #[serde(default = "default_true")]
    pub use_post_quant_conv: bool,
    pub up_block_types: Vec<String>,
}

/// Decode-only `AutoencoderKL`: the encoder half is never touched by this
/// layer, so only the decoder weights are materialized.
#[derive(Debug)]
pub struct AutoencoderKl {
    decoder: Decoder,
    post_quant_conv: Option<Conv2d>,
    scale_factor: f64,
    shift_factor: f64,
}

impl AutoencoderKl {
    pub fn new(cfg: &AutoencoderKlConfig, vb: VarBuilder) -> Result<Self> {
        let decoder = Decoder::new(cfg, vb.pp("decoder"))?;
        let post_quant_conv = if cfg.use_post_quant_conv {
            Some(candle_nn::conv2d(
                cfg.latent_channels,
                cfg.latent_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("post_quant_conv"),
            )?)
        } else {
            None
        };
        Ok(Self {
            decoder,
            post_quant_conv,
            scale_factor: cfg.scaling_factor,
            shift_factor: cfg.shift_factor.unwrap_or(0.),
        })
    }
}

impl VaeModel for AutoencoderKl {
    fn decode(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = match &self.post_quant_conv {
            Some(conv) => xs.apply(conv)?,
            None => xs.clone(),
        };
        xs.apply(&self.decoder)
    }

    fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    fn shift_factor(&self) -> f64 {
        self.shift_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() -> anyhow::Result<()> {
        let raw = r#"{
            "out_channels": 3,
            "block_out_channels": [128, 256, 512, 512],
            "layers_per_block": 2,
            "latent_channels": 4,
            "norm_num_groups": 32,
            "up_block_types": ["UpDecoderBlock2D", "UpDecoderBlock2D", "UpDecoderBlock2D", "UpDecoderBlock2D"]
        }"#;
        let cfg: AutoencoderKlConfig = serde_json::from_str(raw)?;
        assert_eq!(cfg.scaling_factor, 0.18215);
        assert_eq!(cfg.shift_factor, None);
        assert!(cfg.mid_block_add_attention);
        assert!(cfg.use_post_quant_conv);
        assert_eq!(cfg.act_fn, Activation::Silu);
        Ok(())
    }

    #[test]
    fn config_explicit_factors() -> anyhow::Result<()> {
        let raw = r#"{
            "out_channels": 3,
            "block_out_channels": [128],
            "layers_per_block": 1,
            "latent_channels": 16,
            "norm_num_groups": 32,
            "scaling_factor": 0.3611,
            "shift_factor": 0.1159,
            "use_post_quant_conv": false,
            "up_block_types": ["UpDecoderBlock2D"]
        }"#;
        let cfg: AutoencoderKlConfig = serde_json::from_str(raw)?;
        assert_eq!(cfg.scaling_factor, 0.3611);
        assert_eq!(cfg.shift_factor, Some(0.1159));
        assert!(!cfg.use_post_quant_conv);
        Ok(())
    }

    #[test]
    fn tiny_decoder_output_shape() -> anyhow::Result<()> {
        use candle_core::{DType, Device, Tensor};

        let cfg = AutoencoderKlConfig {
            out_channels: 3,
            block_out_channels: vec![4, 4],
            layers_per_block: 1,
            act_fn: Activation::Silu,
            latent_channels: 2,
            norm_num_groups: 2,
            scaling_factor: 0.18215,
            shift_factor: None,
            mid_block_add_attention: false,
            use_post_quant_conv: true,
            up_block_types: vec!["UpDecoderBlock2D".to_string(); 2],
        };
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let vae = AutoencoderKl::new(&cfg, vb)?;
        let latents = Tensor::zeros((2, 2, 4, 4), DType::F32, &device)?;
        let decoded = vae.decode(&latents)?;
        // One 2x upsample per level except the last.
        assert_eq!(decoded.dims(), &[2, 3, 8, 8]);
        Ok(())
    }
}
