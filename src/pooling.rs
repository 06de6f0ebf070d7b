//! Masked concat pooling
//!
//! Reduces encoder output `[batch, seq, hidden]` to `[batch, 3 * hidden]`:
//! the last real hidden state, the max over real positions and the mean over
//! real positions, in that order.

use anyhow::Result;
use candle_core::{IndexOp, Tensor, D};

use crate::error::ModelError;
use crate::masks::{masked_fill, pads_per_row};

/// Pool `output` ignoring positions where `mask` is 1
///
/// Trailing padding is at most `bptt - 1` tokens, so the last real token of a
/// row is found by counting pads in the last `bptt` columns only.
///
/// # Errors
/// [`ModelError::EmptySequence`] if a row is entirely padding.
pub fn masked_concat_pool(output: &Tensor, mask: &Tensor, bptt: usize) -> Result<Tensor> {
    let (bs, sl, _hidden) = output.dims3()?;

    let pads = pads_per_row(mask)?;
    if let Some(row) = pads.iter().position(|&p| p >= sl) {
        return Err(ModelError::EmptySequence { row }.into());
    }
    let window = bptt.min(sl);
    let last_pads = pads_per_row(&mask.narrow(1, sl - window, window)?)?;

    let lens: Vec<f32> = pads.iter().map(|&p| (sl - p) as f32).collect();
    let lens = Tensor::from_vec(lens, (bs, 1), output.device())?.to_dtype(output.dtype())?;
    let avg_pool = masked_fill(output, mask, 0.0)?
        .sum(1)?
        .broadcast_div(&lens)?;
    let max_pool = masked_fill(output, mask, f32::NEG_INFINITY)?.max(D::Minus2)?;

    let last_hidden = last_pads
        .iter()
        .enumerate()
        .map(|(row, &lp)| output.i((row, sl - lp - 1)))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let last_hidden = Tensor::stack(&last_hidden, 0)?;

    Ok(Tensor::cat(&[&last_hidden, &max_pool, &avg_pool], 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn output_from(rows: &[&[f32]]) -> Tensor {
        // hidden = 1 so each row reads as a plain sequence
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len(), 1), &Device::Cpu).unwrap()
    }

    fn mask_from(rows: &[&[u8]]) -> Tensor {
        let flat: Vec<u8> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sentinels_ignored() {
        let output = output_from(&[&[1.0, 3.0, 1000.0], &[-1000.0, 2.0, 4.0]]);
        let mask = mask_from(&[&[0, 0, 1], &[1, 0, 0]]);

        let pooled: Vec<Vec<f32>> = masked_concat_pool(&output, &mask, 2)
            .unwrap()
            .to_vec2()
            .unwrap();

        // [last, max, mean]
        assert_eq!(pooled[0], vec![3.0, 3.0, 2.0]);
        assert_eq!(pooled[1], vec![4.0, 4.0, 3.0]);
    }

    #[test]
    fn test_last_hidden_uses_last_window() {
        // Leading pads outside the last bptt columns do not shift the index
        let output = output_from(&[&[0.0, 0.0, 5.0, 6.0, 7.0, 0.0]]);
        let mask = mask_from(&[&[1, 1, 0, 0, 0, 1]]);

        let pooled: Vec<Vec<f32>> = masked_concat_pool(&output, &mask, 3)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(pooled[0][0], 7.0);
        assert_eq!(pooled[0][1], 7.0);
        assert_eq!(pooled[0][2], 6.0);
    }

    #[test]
    fn test_output_width() {
        let output = Tensor::rand(-1f32, 1f32, (4, 9, 5), &Device::Cpu).unwrap();
        let mask = Tensor::zeros((4, 9), DType::U8, &Device::Cpu).unwrap();
        let pooled = masked_concat_pool(&output, &mask, 4).unwrap();
        assert_eq!(pooled.dims(), &[4, 15]);
    }

    #[test]
    fn test_all_pad_row_rejected() {
        let output = output_from(&[&[1.0, 2.0], &[0.0, 0.0]]);
        let mask = mask_from(&[&[0, 0], &[1, 1]]);
        let err = masked_concat_pool(&output, &mask, 2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ModelError>(),
            Some(&ModelError::EmptySequence { row: 1 })
        );
    }
}
