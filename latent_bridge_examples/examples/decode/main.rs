use std::path::PathBuf;
use std::time::Instant;

use latent_bridge_core::{
    best_device, hub_file, load_vae, ApproxDecoder, ApproxImageDecoder, ModelDType,
    VaeImageDecoder,
};

use clap::Parser;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// File holding the latents to decode, as a safetensors tensor named `latents`
    #[arg(short, long)]
    latents: PathBuf,

    /// VAE `config.json` from a diffusers checkpoint
    #[arg(long)]
    vae_config: Option<PathBuf>,

    /// VAE safetensors file(s)
    #[arg(long)]
    vae_weights: Vec<PathBuf>,

    /// Fetch the VAE from this Hugging Face model repo instead of local files,
    /// e.g. `stable-diffusion-v1-5/stable-diffusion-v1-5`
    #[arg(long, conflicts_with_all = ["vae_config", "vae_weights"])]
    hub_vae: Option<String>,

    /// Approximate decoder safetensors; decodes a fast preview instead of the VAE
    #[arg(long)]
    approx_weights: Option<PathBuf>,

    /// Approximate decoder config (optional, defaults match SD 1.x latents)
    #[arg(long)]
    approx_config: Option<PathBuf>,

    /// DType to run the decoder in
    #[arg(long, default_value = "auto")]
    dtype: ModelDType,

    /// Prefix for the output images
    #[arg(short, long, default_value = "image")]
    out: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device = best_device()?;
    let dtype = args.dtype.resolve(&device);

    let tensors = candle_core::safetensors::load(&args.latents, &device)?;
    let latents = tensors
        .get("latents")
        .ok_or_else(|| anyhow::anyhow!("no `latents` tensor in {}", args.latents.display()))?
        .to_dtype(dtype)?;
    info!("latents have shape {:?}", latents.shape());

    let start = Instant::now();

    let images = match &args.approx_weights {
        Some(weights) => {
            let net = ApproxDecoder::load(
                args.approx_config.as_ref(),
                std::slice::from_ref(weights),
                dtype,
                &device,
            )?;
            ApproxImageDecoder::new(net).decode_to_images(&latents)?
        }
        None => {
            let (config, weights) = match &args.hub_vae {
                Some(repo) => {
                    let config = hub_file(repo, "vae/config.json")?;
                    let weights = hub_file(repo, "vae/diffusion_pytorch_model.safetensors")?;
                    (config, vec![weights])
                }
                None => {
                    let config = args.vae_config.ok_or_else(|| {
                        anyhow::anyhow!("one of --approx-weights, --vae-config or --hub-vae is required")
                    })?;
                    (config, args.vae_weights)
                }
            };
            let vae = load_vae(&config, &weights, dtype, &device)?;
            VaeImageDecoder::new(vae).decode_to_images(&latents)?
        }
    };

    println!("Took: {:.2}s", start.elapsed().as_secs_f32());

    for (idx, image) in images.iter().enumerate() {
        image.save(format!("{}_{idx}.png", args.out))?;
    }

    Ok(())
}
