//! Prompt conditioning and latent decoding for diffusion pipelines.
//!
//! This crate covers the two stateless halves around a diffusion sampler:
//! turning prompt chunks into conditioning embeddings, and turning the
//! sampler's latents back into images, exactly (through a VAE) or
//! approximately (through a small preview net).
//!
//! ```rust,no_run
//! use latent_bridge_core::{
//!     best_device, load_vae, ClipEmbedder, CondBatcher, ModelDType, VaeImageDecoder,
//! };
//!
//! let device = best_device()?;
//! let dtype = ModelDType::Auto.resolve(&device);
//!
//! let embedder = ClipEmbedder::load(
//!     "tokenizer/tokenizer.json",
//!     "text_encoder/config.json",
//!     &["text_encoder/model.safetensors".into()],
//!     dtype,
//!     &device,
//! )?;
//! let chunks = vec![
//!     vec!["a photo of a cat".to_string()],
//!     vec!["an oil painting of a ship".to_string()],
//! ];
//! for conds in CondBatcher::new(|prompts| embedder.embed(prompts)).generate(chunks) {
//!     let conds = conds?;
//!     println!("{:?} {:?}", conds.embedding.shape(), conds.mask.shape());
//! }
//!
//! let vae = load_vae(
//!     "vae/config.json",
//!     &["vae/diffusion_pytorch_model.safetensors".into()],
//!     dtype,
//!     &device,
//! )?;
//! let decoder = VaeImageDecoder::new(vae);
//! # let latents = candle_core::Tensor::zeros((1, 4, 64, 64), dtype, &device)?;
//! let images = decoder.decode_to_images(&latents)?;
//! images[0].save("image.png")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod conds;
mod convert;
mod models;
mod util;

pub use conds::{
    ClipActivation, ClipConfig, ClipEmbedder, ClipTextTransformer, CondBatcher, CondBatches,
    EmbeddingAndMask,
};
pub use convert::{bchw_to_images, ApproxImageDecoder, VaeImageDecoder, INT8_HALF_RANGE};
pub use models::{load_vae, ApproxDecoder, ApproxDecoderConfig, AutoencoderKl, AutoencoderKlConfig, VaeModel};
pub use util::{best_device, hub_file, ModelDType};
