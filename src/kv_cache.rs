//! Per-layer key/value cache for prefill + decode generation
//!
//! The first forward pass over a prompt fills the cache (prefill); every
//! following pass feeds a single token and attends over the cached positions
//! (decode). The recorder relies on that split: it tells the two phases apart
//! by the number of new positions in the attention tensors.
//!
//! Each layer stores keys and values as `[batch, num_kv_heads, seq_len, head_dim]`,
//! before grouped-query expansion.

use anyhow::{bail, Result};
use candle_core::Tensor;

/// Cached keys and values of every decoder layer
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    /// Empty cache for `n_layers` layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![None; n_layers],
        }
    }

    /// Number of layers the cache was built for
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions (0 when empty)
    pub fn seq_len(&self) -> usize {
        self.layers
            .iter()
            .flatten()
            .next()
            .map_or(0, |(k, _)| k.dims().get(2).copied().unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Option::is_none)
    }

    /// Append new keys/values for `layer` and return the full sequences
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let n_layers = self.layers.len();
        let Some(slot) = self.layers.get_mut(layer) else {
            bail!("layer {layer} out of range for a {n_layers}-layer KV cache");
        };

        let (k, v) = match slot.as_ref() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?,
                Tensor::cat(&[prev_v, v], 2)?,
            ),
            None => (k.clone(), v.clone()),
        };
        *slot = Some((k.clone(), v.clone()));
        Ok((k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(seq: usize) -> Tensor {
        Tensor::zeros((1, 2, seq, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_new_cache() {
        let cache = KvCache::new(4);
        assert_eq!(cache.n_layers(), 4);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_prefill_then_decode() {
        let mut cache = KvCache::new(2);
        let (k, v) = cache.append(0, &kv(5), &kv(5)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 5, 4]);
        assert_eq!(v.dims(), &[1, 2, 5, 4]);
        assert_eq!(cache.seq_len(), 5);

        let (k, _) = cache.append(0, &kv(1), &kv(1)).unwrap();
        assert_eq!(k.dim(2).unwrap(), 6);
        assert_eq!(cache.seq_len(), 6);
    }

    #[test]
    fn test_layer_out_of_range() {
        let mut cache = KvCache::new(1);
        assert!(cache.append(3, &kv(1), &kv(1)).is_err());
    }
}
