mod approx;
mod vaes;

pub use approx::{ApproxDecoder, ApproxDecoderConfig};
pub use vaes::{load_vae, AutoencoderKl, AutoencoderKlConfig, VaeModel};
