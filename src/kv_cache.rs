//! Per-layer key/value cache for incremental decoding
//!
//! Layout per layer: `[batch, num_kv_heads, seq_len, head_dim]`, stored
//! before grouped-query expansion.

use candle_core::Tensor;

#[derive(Debug, Clone)]
pub struct KVCache {
    pub keys: Vec<Option<Tensor>>,
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Cached positions (0 when empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(Option::as_ref)
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = None);
        self.values.iter_mut().for_each(|v| *v = None);
    }

    /// `(keys, values)` slots of one layer
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_new_cache_is_empty() {
        let cache = KVCache::new(24);
        assert_eq!(cache.n_layers(), 24);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_seq_len_and_clear() {
        let mut cache = KVCache::new(2);
        let t = Tensor::zeros((1, 2, 7, 4), DType::F32, &Device::Cpu).unwrap();
        let (k, v) = cache.layer_mut(0);
        *k = Some(t.clone());
        *v = Some(t);
        assert_eq!(cache.seq_len(), 7);
        assert!(!cache.is_empty());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }
}
