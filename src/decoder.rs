//! Language-model head
//!
//! Projects every timestep of the encoder output onto the vocabulary.

use anyhow::{ensure, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use crate::dropout::RnnDropout;
use crate::model::{HeadOutput, Stage};

/// Uniform init range for an untied projection
pub const INIT_RANGE: f64 = 0.1;

/// Dropout followed by a linear projection to vocabulary logits
pub struct LinearDecoder {
    decoder: Linear,
    output_dp: RnnDropout,
    tied: bool,
}

impl LinearDecoder {
    /// Build the decoder under `vb` (`decoder.weight`, `decoder.bias`)
    ///
    /// # Arguments
    /// * `n_out` - Vocabulary size
    /// * `n_hid` - Width of the encoder output
    /// * `output_p` - Dropout applied to the encoder output
    /// * `tie_encoder` - Embedding matrix `[n_out, n_hid]` to share as the projection weight
    /// * `bias` - Whether the projection has a (zero-initialized) bias
    pub fn new(
        n_out: usize,
        n_hid: usize,
        output_p: f64,
        tie_encoder: Option<&Tensor>,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("decoder");
        let weight = match tie_encoder {
            Some(embedding) => {
                ensure!(
                    embedding.dims() == [n_out, n_hid],
                    "Cannot tie decoder [{n_out}, {n_hid}] to embedding {:?}",
                    embedding.dims()
                );
                // Same storage: updates to the embedding variable show up here
                embedding.clone()
            }
            None => vb.get_with_hints(
                (n_out, n_hid),
                "weight",
                Init::Uniform {
                    lo: -INIT_RANGE,
                    up: INIT_RANGE,
                },
            )?,
        };
        let bias = if bias {
            Some(vb.get_with_hints(n_out, "bias", Init::Const(0.0))?)
        } else {
            None
        };

        Ok(Self {
            decoder: Linear::new(weight, bias),
            output_dp: RnnDropout::new(output_p),
            tied: tie_encoder.is_some(),
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.decoder.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.decoder.bias()
    }

    pub fn is_tied(&self) -> bool {
        self.tied
    }

    pub fn output_p(&self) -> f64 {
        self.output_dp.p()
    }
}

impl Stage for LinearDecoder {
    type Input = Tensor;
    type Output = HeadOutput;

    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<HeadOutput> {
        let dropped = self.output_dp.forward_t(input, train)?;
        let logits = self.decoder.forward(&dropped)?;
        Ok(HeadOutput {
            output: logits,
            raw: input.clone(),
            dropped,
        })
    }
}
