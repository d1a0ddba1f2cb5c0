//! Decoder half of the diffusers `AutoencoderKL` architecture.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Activation, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use tracing::{span, Span};

use super::autoencoder_kl::AutoencoderKlConfig;

const NORM_EPS: f64 = 1e-6;

fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dim = q.dim(D::Minus1)?;
    let scale = 1.0 / (dim as f64).sqrt();
    let weights = (q.matmul(&k.t()?)? * scale)?;
    candle_nn::ops::softmax_last_dim(&weights)?.matmul(v)
}

/// Single-head self attention over spatial positions, used in the mid block.
///
/// Checkpoints store the projections as linear layers over the channel dim,
/// so the feature map is flattened to `(b, h*w, c)` before applying them.
#[derive(Debug)]
struct AttnBlock {
    group_norm: GroupNorm,
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    span: Span,
}

impl AttnBlock {
    fn new(channels: usize, cfg: &AutoencoderKlConfig, vb: VarBuilder) -> Result<Self> {
        let group_norm = candle_nn::group_norm(
            cfg.norm_num_groups,
            channels,
            NORM_EPS,
            vb.pp("group_norm"),
        )?;
        let to_q = candle_nn::linear(channels, channels, vb.pp("to_q"))?;
        let to_k = candle_nn::linear(channels, channels, vb.pp("to_k"))?;
        let to_v = candle_nn::linear(channels, channels, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(channels, channels, vb.pp("to_out.0"))?;
        Ok(Self {
            group_norm,
            to_q,
            to_k,
            to_v,
            to_out,
            span: span!(tracing::Level::TRACE, "vae-attn"),
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = xs;
        let (b, c, h, w) = xs.dims4()?;
        let xs = xs.apply(&self.group_norm)?;
        // (b, c, h, w) -> (b, h*w, c)
        let xs = xs.flatten_from(2)?.transpose(1, 2)?;
        let q = xs.apply(&self.to_q)?;
        let k = xs.apply(&self.to_k)?;
        let v = xs.apply(&self.to_v)?;
        let xs = scaled_dot_product_attention(&q, &k, &v)?;
        let xs = xs.apply(&self.to_out)?;
        xs.transpose(1, 2)?.reshape((b, c, h, w))? + residual
    }
}

#[derive(Debug)]
struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
    act_fn: Activation,
    span: Span,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, cfg: &AutoencoderKlConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm1 = candle_nn::group_norm(cfg.norm_num_groups, in_c, NORM_EPS, vb.pp("norm1"))?;
        let conv1 = candle_nn::conv2d(in_c, out_c, 3, conv_cfg, vb.pp("conv1"))?;
        let norm2 = candle_nn::group_norm(cfg.norm_num_groups, out_c, NORM_EPS, vb.pp("norm2"))?;
        let conv2 = candle_nn::conv2d(out_c, out_c, 3, conv_cfg, vb.pp("conv2"))?;
        let conv_shortcut = if in_c == out_c {
            None
        } else {
            Some(candle_nn::conv2d(
                in_c,
                out_c,
                1,
                Default::default(),
                vb.pp("conv_shortcut"),
            )?)
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            conv_shortcut,
            act_fn: cfg.act_fn,
            span: span!(tracing::Level::TRACE, "vae-resnet"),
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let h = xs
            .apply(&self.norm1)?
            .apply(&self.act_fn)?
            .apply(&self.conv1)?
            .apply(&self.norm2)?
            .apply(&self.act_fn)?
            .apply(&self.conv2)?;
        match self.conv_shortcut.as_ref() {
            None => xs + h,
            Some(conv) => xs.apply(conv)? + h,
        }
    }
}

#[derive(Debug)]
struct Upsample {
    conv: Conv2d,
    span: Span,
}

impl Upsample {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, conv_cfg, vb.pp("conv"))?;
        Ok(Self {
            conv,
            span: span!(tracing::Level::TRACE, "vae-upsample"),
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(h * 2, w * 2)?.apply(&self.conv)
    }
}

#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResnetBlock>,
    upsample: Option<Upsample>,
}

/// Maps latents `(b, latent_channels, h, w)` to pixel space
/// `(b, out_channels, 8h, 8w)` in `[-1, 1]`.
#[derive(Debug)]
pub struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn: Option<AttnBlock>,
    mid_block_2: ResnetBlock,
    up: Vec<UpBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    act_fn: Activation,
}

impl Decoder {
    pub fn new(cfg: &AutoencoderKlConfig, vb: VarBuilder) -> Result<Self> {
        if !cfg.up_block_types.iter().all(|x| x == "UpDecoderBlock2D") {
            candle_core::bail!("all up block types must be `UpDecoderBlock2D`");
        }
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let base_ch = cfg.block_out_channels[0];
        let mut block_in = cfg.block_out_channels.last().copied().unwrap_or(base_ch);

        let conv_in = candle_nn::conv2d(cfg.latent_channels, block_in, 3, conv_cfg, vb.pp("conv_in"))?;
        let mid_block_1 = ResnetBlock::new(block_in, block_in, cfg, vb.pp("mid_block.resnets.0"))?;
        let mid_attn = if cfg.mid_block_add_attention {
            Some(AttnBlock::new(block_in, cfg, vb.pp("mid_block.attentions.0"))?)
        } else {
            None
        };
        let mid_block_2 = ResnetBlock::new(block_in, block_in, cfg, vb.pp("mid_block.resnets.1"))?;

        let n_levels = cfg.block_out_channels.len();
        let mut up = Vec::with_capacity(n_levels);
        let vb_up = vb.pp("up_blocks");
        for (i_level, out_channels) in cfg.block_out_channels.iter().rev().enumerate() {
            let vb_up = vb_up.pp(i_level);
            let vb_resnets = vb_up.pp("resnets");
            let mut resnets = Vec::with_capacity(cfg.layers_per_block + 1);
            for i_block in 0..=cfg.layers_per_block {
                resnets.push(ResnetBlock::new(block_in, *out_channels, cfg, vb_resnets.pp(i_block))?);
                block_in = *out_channels;
            }
            let upsample = if i_level != n_levels - 1 {
                Some(Upsample::new(block_in, vb_up.pp("upsamplers.0"))?)
            } else {
                None
            };
            up.push(UpBlock { resnets, upsample });
        }

        let norm_out =
            candle_nn::group_norm(cfg.norm_num_groups, base_ch, NORM_EPS, vb.pp("conv_norm_out"))?;
        let conv_out = candle_nn::conv2d(base_ch, cfg.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn,
            mid_block_2,
            up,
            norm_out,
            conv_out,
            act_fn: cfg.act_fn,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.apply(&self.conv_in)?.apply(&self.mid_block_1)?;
        if let Some(attn) = &self.mid_attn {
            h = h.apply(attn)?;
        }
        h = h.apply(&self.mid_block_2)?;
        for block in self.up.iter() {
            for resnet in block.resnets.iter() {
                h = h.apply(resnet)?;
            }
            if let Some(upsample) = &block.upsample {
                h = h.apply(upsample)?;
            }
        }
        h.apply(&self.norm_out)?
            .apply(&self.act_fn)?
            .apply(&self.conv_out)
    }
}
