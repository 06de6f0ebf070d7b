//! Shared padding mask utilities
//!
//! Provides the pad masks used by the sentence encoder and the masked
//! pooling step.
//!
//! ## Mask Convention
//!
//! Masks are `U8` tensors where `1` marks a pad token and `0` a real token.
//! This is the opposite of attention masks (1 = keep), so a mask can be fed
//! straight into `where_cond` to overwrite padded positions.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Build the pad mask for a token batch
///
/// # Returns
///
/// A `U8` tensor with the same shape as `input` (`[batch, seq_len]`), `1`
/// wherever the token equals `pad_idx`.
///
/// # Example
///
/// For pad id 1:
/// ```text
/// [[5, 6, 1],        [[0, 0, 1],
///  [7, 1, 1]]   ->    [0, 1, 1]]
/// ```
pub fn pad_mask(input: &Tensor, pad_idx: u32) -> Result<Tensor> {
    let pad = Tensor::full(pad_idx, input.shape(), input.device())?.to_dtype(input.dtype())?;
    Ok(input.eq(&pad)?)
}

/// Fill positions of `x` where `mask` is set with `value`
///
/// `x` has shape `[batch, seq, hidden]` and `mask` shape `[batch, seq]`; the
/// mask is broadcast over the hidden dimension.
pub fn masked_fill(x: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let mask = mask.unsqueeze(D::Minus1)?.broadcast_as(x.shape())?;
    let fill = Tensor::full(value, x.shape(), x.device())?.to_dtype(x.dtype())?;
    Ok(mask.where_cond(&fill, x)?)
}

/// Number of pad positions per row of a `[batch, seq]` mask
pub fn pads_per_row(mask: &Tensor) -> Result<Vec<usize>> {
    let counts: Vec<u32> = mask.to_dtype(DType::U32)?.sum(1)?.to_vec1()?;
    Ok(counts.into_iter().map(|c| c as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_pad_mask_values() {
        let device = Device::Cpu;
        let input = Tensor::new(&[[5u32, 6, 1], [7, 1, 1]], &device).unwrap();
        let mask = pad_mask(&input, 1).unwrap();

        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(mask.dims(), &[2, 3]);
        let data: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(data, vec![vec![0, 0, 1], vec![0, 1, 1]]);
    }

    #[test]
    fn test_pads_per_row() {
        let device = Device::Cpu;
        let input = Tensor::new(&[[1u32, 1, 4, 4], [4, 4, 4, 4], [1, 1, 1, 1]], &device).unwrap();
        let mask = pad_mask(&input, 1).unwrap();
        assert_eq!(pads_per_row(&mask).unwrap(), vec![2, 0, 4]);
    }

    #[test]
    fn test_masked_fill_broadcasts_over_hidden() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 0]], &device).unwrap();

        let filled = masked_fill(&x, &mask, f32::NEG_INFINITY).unwrap();
        let data: Vec<f32> = filled.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(data[0], 1.0);
        assert_eq!(data[1], 1.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);
        assert!(data[3].is_infinite() && data[3] < 0.0);
        assert_eq!(data[4], 1.0);
        assert_eq!(data[5], 1.0);
    }
}
