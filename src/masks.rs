//! Additive attention masks (`0` = visible, `-inf` = hidden)

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Mask for `new_seq_len` queries starting at `start_pos` over
/// `total_seq_len` keys.
///
/// Query `i` sees keys `0..=start_pos + i`. Shape
/// `[1, 1, new_seq_len, total_seq_len]`. A full causal mask is the case
/// `start_pos == 0`, `new_seq_len == total_seq_len`.
pub fn create_generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    // One new token sees the whole cache
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

/// Square causal mask, `[1, 1, seq_len, seq_len]`
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    create_generation_mask(seq_len, seq_len, 0, device, dtype)
}
