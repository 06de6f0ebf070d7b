//! Classification head
//!
//! Pools the encoder output with [`masked_concat_pool`] and runs the pooled
//! vector through a stack of batch-norm / dropout / linear blocks.

use anyhow::Result;
use candle_core::{ModuleT, Tensor};
use candle_nn::{batch_norm, linear_b, BatchNorm, BatchNormConfig, Dropout, Linear, VarBuilder};

use crate::error::ModelError;
use crate::model::{HeadOutput, Stage};
use crate::pooling::masked_concat_pool;

const BN_EPS: f64 = 1e-5;

/// Batch-norm, dropout, linear and an optional ReLU
///
/// Variables are named by position: `0.*` for the batch-norm, `2.*` for the
/// linear layer. The linear layer has no bias when batch-norm precedes it.
pub struct LinBnDrop {
    bn: Option<BatchNorm>,
    dropout: Dropout,
    linear: Linear,
    relu: bool,
}

impl LinBnDrop {
    pub fn new(
        n_in: usize,
        n_out: usize,
        bn: bool,
        p: f64,
        relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bn = if bn {
            let config = BatchNormConfig {
                eps: BN_EPS,
                ..Default::default()
            };
            Some(batch_norm(n_in, config, vb.pp("0"))?)
        } else {
            None
        };
        let linear = linear_b(n_in, n_out, bn.is_none(), vb.pp("2"))?;
        Ok(Self {
            bn,
            dropout: Dropout::new(p as f32),
            linear,
            relu,
        })
    }

    /// `x` is `[batch, n_in]`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        if let Some(bn) = &self.bn {
            x = bn.forward_t(&x, train)?;
        }
        x = self.dropout.forward_t(&x, train)?;
        x = self.linear.forward_t(&x, train)?;
        if self.relu {
            x = x.relu()?;
        }
        Ok(x)
    }
}

/// Squash to `(low, high)` with a scaled sigmoid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmoidRange {
    pub low: f64,
    pub high: f64,
}

impl SigmoidRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(x)?.affine(self.high - self.low, self.low)?)
    }
}

/// Pooling head producing one prediction per sequence
pub struct PoolingLinearClassifier {
    layers: Vec<LinBnDrop>,
    y_range: Option<SigmoidRange>,
    bptt: usize,
}

impl PoolingLinearClassifier {
    /// Build the head under `vb` (`layers.{i}.*`)
    ///
    /// # Arguments
    /// * `dims` - Layer widths, starting with the pooled width `3 * hidden`
    /// * `ps` - One dropout per block, so `dims.len() - 1` values
    /// * `bptt` - Chunk length used by the encoder, for last-token lookup
    /// * `y_range` - Squash predictions into `(low, high)`
    pub fn new(
        dims: &[usize],
        ps: &[f64],
        bptt: usize,
        y_range: Option<(f64, f64)>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if dims.len() < 2 || ps.len() != dims.len() - 1 {
            return Err(ModelError::LayerMismatch {
                layers: dims.len(),
                expected: dims.len().saturating_sub(1),
                dropouts: ps.len(),
            }
            .into());
        }

        let n_blocks = ps.len();
        let vb = vb.pp("layers");
        let layers = ps
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let relu = i + 1 < n_blocks;
                LinBnDrop::new(dims[i], dims[i + 1], true, p, relu, vb.pp(i.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            y_range: y_range.map(|(low, high)| SigmoidRange::new(low, high)),
            bptt,
        })
    }

    pub fn n_blocks(&self) -> usize {
        self.layers.len()
    }

    pub fn y_range(&self) -> Option<SigmoidRange> {
        self.y_range
    }
}

impl Stage for PoolingLinearClassifier {
    type Input = (Tensor, Tensor);
    type Output = HeadOutput;

    fn forward_t(&mut self, input: &(Tensor, Tensor), train: bool) -> Result<HeadOutput> {
        let (out, mask) = input;
        let mut x = masked_concat_pool(out, mask, self.bptt)?;
        for layer in &self.layers {
            x = layer.forward_t(&x, train)?;
        }
        if let Some(range) = &self.y_range {
            x = range.forward(&x)?;
        }
        Ok(HeadOutput {
            output: x,
            raw: out.clone(),
            dropped: out.clone(),
        })
    }
}
