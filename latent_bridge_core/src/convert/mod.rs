//! Latent -> image conversion.
//!
//! Two paths produce viewable RGB images from diffusion latents: the exact
//! one through a full VAE decoder, and an approximate one through a small
//! learned net. Both return one image per batch element, in batch order.

use std::sync::Arc;

use candle_core::{DType, Result, Tensor};
use image::{DynamicImage, RgbImage};

use crate::models::{ApproxDecoder, VaeModel};

/// Half the `u8` value range; the approximate decoder's outputs are scaled
/// and offset by this to land in `[0, 255]`.
pub const INT8_HALF_RANGE: f64 = 127.5;

fn raster_from_raw(w: usize, h: usize, data: Vec<u8>) -> Result<DynamicImage> {
    let image = RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| candle_core::Error::Msg("RGB image has invalid capacity".to_string()))?;
    Ok(DynamicImage::ImageRgb8(image))
}

/// Convert `(b, 3, h, w)` floats in `[0, 1]` into one RGB image per batch
/// element.
pub fn bchw_to_images(img: &Tensor) -> Result<Vec<DynamicImage>> {
    let (bsz, c, h, w) = img.dims4()?;
    if c != 3 {
        candle_core::bail!("expected 3 channels in image output, got {c}");
    }
    // f32 keeps this cheap and compatible with bf16 model outputs.
    let img = (img.to_dtype(DType::F32)? * 255.)?
        .round()?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?;
    let mut images = Vec::with_capacity(bsz);
    for sample in img.chunk(bsz, 0)? {
        let flattened = sample.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
        images.push(raster_from_raw(w, h, flattened.to_vec1::<u8>()?)?);
    }
    Ok(images)
}

/// Exact decoding path through a full VAE.
pub struct VaeImageDecoder {
    vae: Arc<dyn VaeModel>,
}

impl VaeImageDecoder {
    pub fn new(vae: Arc<dyn VaeModel>) -> Self {
        Self { vae }
    }

    /// Rescale latents by the VAE's factors (exactly once), decode, and map
    /// the decoder's `[-1, 1]` output into `[0, 1]`.
    pub fn to_bchw(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = ((latents / self.vae.scale_factor())? + self.vae.shift_factor())?;
        let bsz = latents.dim(0)?;
        // Batched VAE decodes are broken on Metal upstream; fall back to
        // one sample at a time and concatenate.
        let decoded = if latents.device().is_metal() && bsz > 1 {
            let mut samples = Vec::with_capacity(bsz);
            for sample in latents.chunk(bsz, 0)? {
                samples.push(self.vae.decode(&sample)?);
            }
            Tensor::cat(&samples, 0)?
        } else {
            self.vae.decode(&latents)?
        };
        ((decoded / 2.)? + 0.5)?.clamp(0f32, 1f32)
    }

    pub fn decode_to_images(&self, latents: &Tensor) -> Result<Vec<DynamicImage>> {
        bchw_to_images(&self.to_bchw(latents)?)
    }
}

/// Approximate decoding path through the per-pixel preview net.
pub struct ApproxImageDecoder {
    net: ApproxDecoder,
}

impl ApproxImageDecoder {
    pub fn new(net: ApproxDecoder) -> Self {
        Self { net }
    }

    /// Decode `(b, c, h, w)` latents into one RGB image per batch element.
    ///
    /// The net output is scaled by [`INT8_HALF_RANGE`], offset by the same
    /// constant, rounded, clamped to `[0, 255]` and cast to `u8`.
    pub fn decode_to_images(&self, latents: &Tensor) -> Result<Vec<DynamicImage>> {
        let channels_last = latents.permute((0, 2, 3, 1))?.contiguous()?;
        let decoded = channels_last.apply(&self.net)?;
        let decoded = ((decoded * INT8_HALF_RANGE)? + INT8_HALF_RANGE)?;
        let img = decoded
            .to_dtype(DType::F32)?
            .round()?
            .clamp(0f32, 255f32)?
            .to_dtype(DType::U8)?;
        let (bsz, h, w, c) = img.dims4()?;
        if c != 3 {
            candle_core::bail!("expected 3 channels in image output, got {c}");
        }
        let mut images = Vec::with_capacity(bsz);
        for sample in img.chunk(bsz, 0)? {
            let flattened = sample.flatten_all()?;
            images.push(raster_from_raw(w, h, flattened.to_vec1::<u8>()?)?);
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use super::*;
    use crate::models::{ApproxDecoder, ApproxDecoderConfig};

    /// Decodes to its own input, making the caller-side rescaling observable.
    #[derive(Debug)]
    struct IdentityVae;

    impl VaeModel for IdentityVae {
        fn decode(&self, xs: &Tensor) -> Result<Tensor> {
            Ok(xs.clone())
        }

        fn scale_factor(&self) -> f64 {
            0.18215
        }

        fn shift_factor(&self) -> f64 {
            0.
        }
    }

    #[test]
    fn vae_rescaling_applied_exactly_once() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // One latent per batch element: 0.18215 -> 1.0 -> pixel 1.0,
        // -0.18215 -> -1.0 -> pixel 0.0, 0 -> 0.5.
        let latents = Tensor::new(vec![0.18215f32, -0.18215, 0.], &device)?
            .reshape((3, 1, 1, 1))?;
        let decoder = VaeImageDecoder::new(Arc::new(IdentityVae));
        let bchw = decoder.to_bchw(&latents)?;
        let values = bchw.flatten_all()?.to_vec1::<f32>()?;
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!(values[1].abs() < 1e-6);
        assert!((values[2] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[derive(Debug)]
    struct UpscaleVae;

    impl VaeModel for UpscaleVae {
        fn decode(&self, xs: &Tensor) -> Result<Tensor> {
            Tensor::zeros((xs.dim(0)?, 3, 2, 2), xs.dtype(), xs.device())
        }

        fn scale_factor(&self) -> f64 {
            0.18215
        }

        fn shift_factor(&self) -> f64 {
            0.
        }
    }

    #[test]
    fn vae_image_count_matches_batch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let latents = Tensor::zeros((4, 4, 8, 8), DType::F32, &device)?;
        let decoder = VaeImageDecoder::new(Arc::new(UpscaleVae));
        let images = decoder.decode_to_images(&latents)?;
        assert_eq!(images.len(), 4);
        assert_eq!(images[0].width(), 2);
        assert_eq!(images[0].height(), 2);
        Ok(())
    }

    #[test]
    fn bchw_pixel_math() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // Values straddling the valid range; 2.0 and -1.0 must clamp.
        let img = Tensor::new(vec![0f32, 0.5, 1., 2., -1., 0.2], &device)?
            .reshape((2, 3, 1, 1))?;
        let images = bchw_to_images(&img)?;
        assert_eq!(images.len(), 2);
        let first = images[0].to_rgb8();
        assert_eq!(first.get_pixel(0, 0).0, [0, 128, 255]);
        let second = images[1].to_rgb8();
        assert_eq!(second.get_pixel(0, 0).0, [255, 0, 51]);
        Ok(())
    }

    #[test]
    fn bf16_inputs_are_cast_for_pixel_math() -> anyhow::Result<()> {
        use half::bf16;
        let device = Device::Cpu;
        let values = vec![bf16::from_f32(0.), bf16::from_f32(0.5), bf16::from_f32(1.)];
        let img = Tensor::new(values, &device)?.reshape((1, 3, 1, 1))?;
        let images = bchw_to_images(&img)?;
        assert_eq!(images[0].to_rgb8().get_pixel(0, 0).0, [0, 128, 255]);
        Ok(())
    }

    #[test]
    fn bchw_rejects_non_rgb() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let img = Tensor::zeros((1, 4, 2, 2), DType::F32, &device)?;
        assert!(bchw_to_images(&img).is_err());
        Ok(())
    }

    fn fixed_approx_net(device: &Device) -> anyhow::Result<ApproxDecoder> {
        // proj_in is the identity; proj_out picks +ch0, -ch0 and a constant
        // zero, exercising both clamp edges and the midpoint.
        let mut tensors = HashMap::new();
        let identity = (0..4)
            .map(|i| (0..4).map(|j| if i == j { 1f32 } else { 0. }).collect())
            .collect::<Vec<Vec<f32>>>();
        tensors.insert("proj_in.weight".to_string(), Tensor::new(identity, device)?);
        tensors.insert("proj_in.bias".to_string(), Tensor::zeros(4, DType::F32, device)?);
        tensors.insert(
            "proj_out.weight".to_string(),
            Tensor::new(
                vec![
                    vec![1f32, 0., 0., 0.],
                    vec![-1f32, 0., 0., 0.],
                    vec![0f32, 0., 0., 0.],
                ],
                device,
            )?,
        );
        tensors.insert("proj_out.bias".to_string(), Tensor::zeros(3, DType::F32, device)?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let cfg = ApproxDecoderConfig {
            latent_channels: 4,
            hidden_size: 4,
            out_channels: 3,
        };
        Ok(ApproxDecoder::new(&cfg, vb)?)
    }

    #[test]
    fn approx_output_in_byte_range() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let net = fixed_approx_net(&device)?;
        let decoder = ApproxImageDecoder::new(net);
        // ch0 = 100 saturates both signed projections after scaling.
        let latents = Tensor::new(vec![100f32, 0., 0., 0.], &device)?.reshape((1, 4, 1, 1))?;
        let images = decoder.decode_to_images(&latents)?;
        assert_eq!(images.len(), 1);
        let rgb = images[0].to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 128]);
        Ok(())
    }

    #[test]
    fn approx_image_count_matches_batch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let net = fixed_approx_net(&device)?;
        let decoder = ApproxImageDecoder::new(net);
        let latents = Tensor::randn(0f32, 1f32, (3, 4, 2, 5), &device)?;
        let images = decoder.decode_to_images(&latents)?;
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].width(), 5);
        assert_eq!(images[0].height(), 2);
        Ok(())
    }
}
