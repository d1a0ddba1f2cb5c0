//! Conditioning batch generation.
//!
//! Turns an ordered stream of prompt chunks into one embedding-and-mask
//! result per chunk, lazily and in input order. The embedding function is the
//! only collaborator; any failure it reports is yielded to the caller
//! unchanged.

use candle_core::{Result, Tensor};

mod clip;

pub use clip::{ClipActivation, ClipConfig, ClipEmbedder, ClipTextTransformer};

/// A text embedding together with its attention mask.
///
/// `embedding` is `(batch, seq, hidden)`, `mask` is `(batch, seq)` with ones
/// over real tokens and zeros over padding. Both are opaque to this layer.
#[derive(Debug, Clone)]
pub struct EmbeddingAndMask {
    pub embedding: Tensor,
    pub mask: Tensor,
}

/// Wraps an embedding function and drives it over pre-chunked prompts.
///
/// The batcher holds no state besides the function itself: chunks are neither
/// reordered, merged nor skipped, and nothing is embedded until the returned
/// iterator is advanced.
pub struct CondBatcher<F> {
    make_conds: F,
}

impl<F> CondBatcher<F>
where
    F: FnMut(&[String]) -> Result<EmbeddingAndMask>,
{
    pub fn new(make_conds: F) -> Self {
        Self { make_conds }
    }

    /// Lazily produce one [`EmbeddingAndMask`] per chunk, preserving order.
    pub fn generate<I>(self, chunks: I) -> CondBatches<F, I::IntoIter>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        CondBatches {
            make_conds: self.make_conds,
            chunks: chunks.into_iter(),
        }
    }
}

/// Iterator returned by [`CondBatcher::generate`].
pub struct CondBatches<F, I> {
    make_conds: F,
    chunks: I,
}

impl<F, I> Iterator for CondBatches<F, I>
where
    F: FnMut(&[String]) -> Result<EmbeddingAndMask>,
    I: Iterator<Item = Vec<String>>,
{
    type Item = Result<EmbeddingAndMask>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        Some((self.make_conds)(&chunk))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use candle_core::{DType, Device, Tensor};

    use super::{CondBatcher, EmbeddingAndMask};

    fn fake_conds(tag: f32, len: usize) -> candle_core::Result<EmbeddingAndMask> {
        let device = Device::Cpu;
        Ok(EmbeddingAndMask {
            embedding: Tensor::full(tag, (len, 3, 4), &device)?,
            mask: Tensor::ones((len, 3), DType::U32, &device)?,
        })
    }

    #[test]
    fn preserves_chunk_order() -> anyhow::Result<()> {
        let chunks = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
            vec!["d".to_string(), "e".to_string(), "f".to_string()],
        ];
        let batcher = CondBatcher::new(|prompts: &[String]| {
            fake_conds(prompts.len() as f32, prompts.len())
        });
        let sizes = batcher
            .generate(chunks)
            .map(|r| Ok(r?.embedding.dim(0)?))
            .collect::<anyhow::Result<Vec<_>>>()?;
        assert_eq!(sizes, vec![2, 1, 3]);
        Ok(())
    }

    #[test]
    fn invokes_embed_once_per_chunk() -> anyhow::Result<()> {
        let calls = Cell::new(0usize);
        let chunks = vec![vec!["a".to_string()], vec!["b".to_string()]];
        let batcher = CondBatcher::new(|prompts: &[String]| {
            calls.set(calls.get() + 1);
            fake_conds(0., prompts.len())
        });
        let produced = batcher.generate(chunks).count();
        assert_eq!(produced, 2);
        assert_eq!(calls.get(), 2);
        Ok(())
    }

    #[test]
    fn is_lazy() {
        let calls = Cell::new(0usize);
        let chunks = vec![vec!["a".to_string()], vec!["b".to_string()]];
        let batcher = CondBatcher::new(|prompts: &[String]| {
            calls.set(calls.get() + 1);
            fake_conds(0., prompts.len())
        });
        let mut batches = batcher.generate(chunks);
        assert_eq!(calls.get(), 0);
        let _ = batches.next();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn propagates_embed_errors() {
        let chunks = vec![vec!["a".to_string()], vec!["boom".to_string()]];
        let batcher = CondBatcher::new(|prompts: &[String]| {
            if prompts[0] == "boom" {
                candle_core::bail!("embed failed")
            }
            fake_conds(0., prompts.len())
        });
        let results = batcher.generate(chunks).collect::<Vec<_>>();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
