use std::path::PathBuf;

use latent_bridge_core::{best_device, ClipEmbedder, CondBatcher, ModelDType};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// `tokenizer.json` from a diffusers checkpoint
    #[arg(long)]
    tokenizer: PathBuf,

    /// Text encoder `config.json`
    #[arg(long)]
    config: PathBuf,

    /// Text encoder safetensors file(s)
    #[arg(long)]
    weights: Vec<PathBuf>,

    /// Prompts to embed
    #[arg(short, long, num_args = 1..)]
    prompts: Vec<String>,

    /// Number of prompts embedded per chunk
    #[arg(long, default_value_t = 2)]
    chunk_size: usize,

    /// DType to run the text encoder in
    #[arg(long, default_value = "auto")]
    dtype: ModelDType,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device = best_device()?;
    let dtype = args.dtype.resolve(&device);

    let embedder = ClipEmbedder::load(&args.tokenizer, &args.config, &args.weights, dtype, &device)?;

    let chunks = args
        .prompts
        .chunks(args.chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect::<Vec<_>>();

    let batcher = CondBatcher::new(|prompts: &[String]| embedder.embed(prompts));
    for (idx, conds) in batcher.generate(chunks).enumerate() {
        let conds = conds?;
        println!(
            "chunk {idx}: embedding {:?}, mask {:?}",
            conds.embedding.dims(),
            conds.mask.dims()
        );
    }

    Ok(())
}
