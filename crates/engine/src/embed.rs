//! Embedding seam. The engine depends only on a synchronous batched encode;
//! the multilingual model behind it is an injected capability, not a
//! framework.

/// Batched text-embedding capability.
pub trait Embedder {
    /// Encode all texts in one batched call, one vector per input text.
    fn encode(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// Degenerate embedder returning zero vectors. Zero-norm embeddings count
/// as absent downstream, so the text-similarity fallback takes over and all
/// pipeline invariants still hold.
pub struct ZeroEmbedder;

impl Embedder for ZeroEmbedder {
    fn encode(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|_| vec![0.0; 8]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_embedder_shape() {
        let out = ZeroEmbedder.encode(&["a".into(), "b".into()]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.iter().all(|x| *x == 0.0)));
    }
}
