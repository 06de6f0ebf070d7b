//! Dropout primitives for recurrent text models
//!
//! - `RnnDropout`: one mask per sequence, shared across all timesteps
//! - `EmbeddingDropout`: drops whole rows of an embedding matrix
//! - `dropout_mask`: the scaled Bernoulli keep-mask both are built from
//!
//! All of them are the identity when not training or when `p == 0`.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Shape, Tensor};

/// Bernoulli keep-mask of the given shape, scaled by `1 / (1 - p)`
///
/// Entries are `0` with probability `p` and `1 / (1 - p)` otherwise, so the
/// expected value of `x * mask` equals `x`.
pub fn dropout_mask<S: Into<Shape>>(shape: S, p: f64, device: &Device) -> Result<Tensor> {
    ensure!((0.0..1.0).contains(&p), "Dropout probability must be in [0, 1), got {p}");
    let shape = shape.into();
    let uniform = Tensor::rand(0f32, 1f32, shape.clone(), device)?;
    let threshold = Tensor::full(p as f32, shape, device)?;
    let keep = uniform.ge(&threshold)?.to_dtype(DType::F32)?;
    Ok(keep.affine(1.0 / (1.0 - p), 0.0)?)
}

/// Dropout with a mask shared along the sequence axis
///
/// Input is `[batch, seq, features]`; the mask has shape `[batch, 1, features]`
/// so a dropped feature stays dropped for the whole sequence.
#[derive(Debug, Clone, Copy)]
pub struct RnnDropout {
    p: f64,
}

impl RnnDropout {
    pub fn new(p: f64) -> Self {
        Self { p }
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p == 0.0 {
            return Ok(x.clone());
        }
        let (b, _t, f) = x.dims3()?;
        let mask = dropout_mask((b, 1, f), self.p, x.device())?.to_dtype(x.dtype())?;
        Ok(x.broadcast_mul(&mask)?)
    }
}

/// Dropout over embedding rows
///
/// A dropped row zeroes the embedding of that token id everywhere in the
/// batch, rather than individual activations.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingDropout {
    p: f64,
}

impl EmbeddingDropout {
    pub fn new(p: f64) -> Self {
        Self { p }
    }

    /// Look up `ids` (`[batch, seq]`, `U32`) in `weight` (`[vocab, emb]`)
    ///
    /// Returns `[batch, seq, emb]`.
    pub fn forward_t(&self, weight: &Tensor, ids: &Tensor, train: bool) -> Result<Tensor> {
        let weight = if train && self.p > 0.0 {
            let (vocab, _) = weight.dims2()?;
            let mask = dropout_mask((vocab, 1), self.p, weight.device())?.to_dtype(weight.dtype())?;
            weight.broadcast_mul(&mask)?
        } else {
            weight.clone()
        };
        let (b, t) = ids.dims2()?;
        let emb = weight.dim(1)?;
        let flat = weight.index_select(&ids.flatten_all()?, 0)?;
        Ok(flat.reshape((b, t, emb))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rnn_dropout_eval_is_identity() {
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (2, 5, 4), &device).unwrap();
        let out = RnnDropout::new(0.5).forward_t(&x, false).unwrap();
        let diff: f32 = (out - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_rnn_dropout_mask_shared_over_sequence() {
        let device = Device::Cpu;
        let x = Tensor::ones((3, 6, 8), DType::F32, &device).unwrap();
        let out = RnnDropout::new(0.5).forward_t(&x, true).unwrap();
        let data: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();

        for row in &data {
            for step in row {
                assert_eq!(step, &row[0]);
                for &v in step {
                    assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_embedding_dropout_zeroes_whole_rows() {
        let device = Device::Cpu;
        let weight = Tensor::ones((50, 4), DType::F32, &device).unwrap();
        let ids = Tensor::new(&[[3u32, 3, 7], [7, 9, 3]], &device).unwrap();

        let out = EmbeddingDropout::new(0.5).forward_t(&weight, &ids, true).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);

        let data: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        // Token 3 appears at (0,0), (0,1) and (1,2): same row of the dropped matrix
        assert_eq!(data[0][0], data[0][1]);
        assert_eq!(data[0][0], data[1][2]);
        for v in &data[0][0] {
            assert_eq!(*v, data[0][0][0]);
        }
    }

    #[test]
    fn test_dropout_mask_rejects_p_one() {
        assert!(dropout_mask((2, 2), 1.0, &Device::Cpu).is_err());
    }
}
