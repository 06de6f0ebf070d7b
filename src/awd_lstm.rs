//! AWD-LSTM encoder
//!
//! Multi-layer LSTM with the regularization of Merity et al. (2017),
//! implemented with candle tensor operations:
//! - Embedding dropout (whole vocabulary rows)
//! - Variational (RNN) dropout on the input and between layers
//! - Weight dropout (DropConnect) on each hidden-to-hidden matrix
//!
//! Hidden state survives between calls so consecutive chunks of one sequence
//! see each other's state; `reset()` clears it. The state follows the batch
//! size of the incoming chunk: extra rows are dropped, missing rows start
//! from zeros.

use anyhow::{ensure, Context, Result};
use candle_core::{IndexOp, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::ArchConfig;
use crate::dropout::{dropout_mask, EmbeddingDropout, RnnDropout};
use crate::model::{Reset, TextArch};
use crate::registry::{count_indexed, split_by_prefix, ModelMeta};

/// Registry name
pub const ARCH_NAME: &str = "awd_lstm";

/// WikiText-103 pretrained weights
pub const WT103_FWD_URL: &str = "https://s3.amazonaws.com/fast-ai-modelzoo/wt103-fwd.tgz";
pub const WT103_BWD_URL: &str = "https://s3.amazonaws.com/fast-ai-modelzoo/wt103-bwd.tgz";

/// Embedding init range
const INIT_RANGE: f64 = 0.1;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwdLstmConfig {
    /// Embedding width, also the output width of the last layer
    #[serde(default = "default_emb_sz")]
    pub emb_sz: usize,
    /// Width of the intermediate layers
    #[serde(default = "default_n_hid")]
    pub n_hid: usize,
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default = "default_pad_token")]
    pub pad_token: u32,
    /// Only `false` is supported
    #[serde(default)]
    pub bidir: bool,
    #[serde(default = "default_hidden_p")]
    pub hidden_p: f64,
    #[serde(default = "default_input_p")]
    pub input_p: f64,
    #[serde(default = "default_embed_p")]
    pub embed_p: f64,
    #[serde(default = "default_weight_p")]
    pub weight_p: f64,
}

fn default_emb_sz() -> usize {
    400
}
fn default_n_hid() -> usize {
    1152
}
fn default_n_layers() -> usize {
    3
}
fn default_pad_token() -> u32 {
    1
}
fn default_hidden_p() -> f64 {
    0.2
}
fn default_input_p() -> f64 {
    0.6
}
fn default_embed_p() -> f64 {
    0.1
}
fn default_weight_p() -> f64 {
    0.5
}

impl Default for AwdLstmConfig {
    fn default() -> Self {
        Self {
            emb_sz: default_emb_sz(),
            n_hid: default_n_hid(),
            n_layers: default_n_layers(),
            pad_token: default_pad_token(),
            bidir: false,
            hidden_p: default_hidden_p(),
            input_p: default_input_p(),
            embed_p: default_embed_p(),
            weight_p: default_weight_p(),
        }
    }
}

impl AwdLstmConfig {
    /// Output width of layer `l`
    fn layer_out(&self, l: usize) -> usize {
        if l + 1 == self.n_layers {
            self.emb_sz
        } else {
            self.n_hid
        }
    }

    /// Input width of layer `l`
    fn layer_in(&self, l: usize) -> usize {
        if l == 0 {
            self.emb_sz
        } else {
            self.n_hid
        }
    }
}

fn base_config() -> ArchConfig {
    ArchConfig::new()
        .with("emb_sz", 400)
        .with("n_hid", 1152)
        .with("n_layers", 3)
        .with("pad_token", 1)
        .with("bidir", false)
}

/// Default language-model config
pub fn awd_lstm_lm_config() -> ArchConfig {
    base_config()
        .with("output_p", 0.1)
        .with("hidden_p", 0.15)
        .with("input_p", 0.25)
        .with("embed_p", 0.02)
        .with("weight_p", 0.2)
        .with("tie_weights", true)
        .with("out_bias", true)
}

/// Default classifier config
pub fn awd_lstm_clas_config() -> ArchConfig {
    base_config()
        .with("output_p", 0.4)
        .with("hidden_p", 0.3)
        .with("input_p", 0.4)
        .with("embed_p", 0.05)
        .with("weight_p", 0.5)
}

// ============================================================================
// LSTM layer with weight dropout
// ============================================================================

/// Per-layer recurrent state, each `[batch, hidden]`
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

impl LstmState {
    fn zeros(batch: usize, hidden: usize, like: &Tensor) -> Result<Self> {
        let h = Tensor::zeros((batch, hidden), like.dtype(), like.device())?;
        Ok(Self { c: h.clone(), h })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.h.dim(0)?)
    }

    fn detach(&self) -> Self {
        Self {
            h: self.h.detach(),
            c: self.c.detach(),
        }
    }

    /// Truncate to, or zero-extend to, `batch` rows
    fn resize(&self, batch: usize) -> Result<Self> {
        let current = self.batch_size()?;
        let resize_one = |t: &Tensor| -> Result<Tensor> {
            if current > batch {
                Ok(t.narrow(0, 0, batch)?)
            } else if current < batch {
                let extra = Tensor::zeros((batch - current, t.dim(1)?), t.dtype(), t.device())?;
                Ok(Tensor::cat(&[t, &extra], 0)?)
            } else {
                Ok(t.clone())
            }
        };
        Ok(Self {
            h: resize_one(&self.h)?,
            c: resize_one(&self.c)?,
        })
    }
}

struct LstmLayer {
    weight_ih: Tensor,     // [4 * hidden, n_in]
    weight_hh_raw: Tensor, // [4 * hidden, hidden], weight-dropped in training
    bias_ih: Tensor,       // [4 * hidden]
    bias_hh: Tensor,       // [4 * hidden]
    hidden: usize,
    weight_p: f64,
}

impl LstmLayer {
    fn load(vb: VarBuilder, n_in: usize, hidden: usize, weight_p: f64) -> Result<Self> {
        let bound = 1.0 / (hidden as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight_ih = vb.get_with_hints((4 * hidden, n_in), "weight_ih_l0", init)?;
        let weight_hh_raw = vb.get_with_hints((4 * hidden, hidden), "weight_hh_l0_raw", init)?;
        let bias_ih = vb.get_with_hints(4 * hidden, "bias_ih_l0", init)?;
        let bias_hh = vb.get_with_hints(4 * hidden, "bias_hh_l0", init)?;
        Ok(Self {
            weight_ih,
            weight_hh_raw,
            bias_ih,
            bias_hh,
            hidden,
            weight_p,
        })
    }

    /// Run the layer over `x` `[batch, seq, n_in]`
    ///
    /// # Returns
    /// (output `[batch, seq, hidden]`, state after the last timestep)
    fn forward_t(
        &self,
        x: &Tensor,
        state: Option<&LstmState>,
        train: bool,
    ) -> Result<(Tensor, LstmState)> {
        let (b, t, n_in) = x.dims3()?;
        let four_h = 4 * self.hidden;

        let weight_hh = if train && self.weight_p > 0.0 {
            let mask = dropout_mask(self.weight_hh_raw.shape().clone(), self.weight_p, x.device())?
                .to_dtype(self.weight_hh_raw.dtype())?;
            (&self.weight_hh_raw * mask)?
        } else {
            self.weight_hh_raw.clone()
        };
        let weight_hh_t = weight_hh.t()?.contiguous()?;

        // Input contribution for every timestep at once: [b, t, 4h]
        let xw = x
            .reshape((b * t, n_in))?
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&(&self.bias_ih + &self.bias_hh)?)?
            .reshape((b, t, four_h))?;

        let LstmState { mut h, mut c } = match state {
            Some(s) => s.clone(),
            None => LstmState::zeros(b, self.hidden, x)?,
        };

        let mut outputs: Vec<Tensor> = Vec::with_capacity(t);
        for ti in 0..t {
            let gates = (xw.i((.., ti, ..))? + h.matmul(&weight_hh_t)?)?; // [b, 4h]
            let gates = gates
                .chunk(4, 1)?
                .into_iter()
                .map(|g| g.contiguous())
                .collect::<candle_core::Result<Vec<_>>>()?;
            let input_gate = candle_nn::ops::sigmoid(&gates[0])?;
            let forget_gate = candle_nn::ops::sigmoid(&gates[1])?;
            let cell_gate = gates[2].tanh()?;
            let output_gate = candle_nn::ops::sigmoid(&gates[3])?;

            c = ((forget_gate * &c)? + (input_gate * cell_gate)?)?;
            h = (output_gate * c.tanh()?)?;
            outputs.push(h.clone());
        }

        let out = Tensor::stack(&outputs, 1)?;
        Ok((out, LstmState { h, c }))
    }
}

// ============================================================================
// AwdLstm
// ============================================================================

pub struct AwdLstm {
    encoder_weight: Tensor, // [vocab, emb_sz]
    encoder_dp: EmbeddingDropout,
    input_dp: RnnDropout,
    rnns: Vec<LstmLayer>,
    hidden_dps: Vec<RnnDropout>,
    config: AwdLstmConfig,
    hidden: Option<Vec<LstmState>>,
}

impl AwdLstm {
    /// Build the encoder; variables are created under `vb`
    ///
    /// Names: `encoder.weight`, `rnns.{l}.weight_ih_l0`,
    /// `rnns.{l}.weight_hh_l0_raw`, `rnns.{l}.bias_ih_l0`, `rnns.{l}.bias_hh_l0`.
    pub fn new(vocab_sz: usize, config: AwdLstmConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(!config.bidir, "Bidirectional AWD-LSTM is not supported");
        ensure!(config.n_layers > 0, "AWD-LSTM needs at least one layer");

        let encoder_weight = vb.pp("encoder").get_with_hints(
            (vocab_sz, config.emb_sz),
            "weight",
            Init::Uniform {
                lo: -INIT_RANGE,
                up: INIT_RANGE,
            },
        )?;

        let mut rnns = Vec::with_capacity(config.n_layers);
        for l in 0..config.n_layers {
            let layer = LstmLayer::load(
                vb.pp(format!("rnns.{l}")),
                config.layer_in(l),
                config.layer_out(l),
                config.weight_p,
            )?;
            rnns.push(layer);
        }
        let hidden_dps = (0..config.n_layers)
            .map(|_| RnnDropout::new(config.hidden_p))
            .collect();

        debug!(
            "AWD-LSTM: vocab={}, emb_sz={}, n_hid={}, layers={}",
            vocab_sz, config.emb_sz, config.n_hid, config.n_layers
        );

        Ok(Self {
            encoder_weight,
            encoder_dp: EmbeddingDropout::new(config.embed_p),
            input_dp: RnnDropout::new(config.input_p),
            rnns,
            hidden_dps,
            config,
            hidden: None,
        })
    }

    /// Registry constructor: parse `config` and build
    pub fn from_config(
        vocab_sz: usize,
        config: &ArchConfig,
        vb: VarBuilder,
    ) -> Result<Box<dyn TextArch>> {
        let config: AwdLstmConfig = config
            .deserialize()
            .context("Invalid AWD-LSTM config")?;
        Ok(Box::new(Self::new(vocab_sz, config, vb)?))
    }

    pub fn config(&self) -> &AwdLstmConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.rnns.len()
    }

    /// Current recurrent state, one entry per layer (`None` after reset)
    pub fn hidden_state(&self) -> Option<&[LstmState]> {
        self.hidden.as_deref()
    }
}

impl Reset for AwdLstm {
    fn reset(&mut self) {
        self.hidden = None;
    }
}

impl TextArch for AwdLstm {
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        let (bs, _sl) = input.dims2()?;

        if let Some(hidden) = &self.hidden {
            if hidden[0].batch_size()? != bs {
                let resized = hidden
                    .iter()
                    .map(|s| s.resize(bs))
                    .collect::<Result<Vec<_>>>()?;
                self.hidden = Some(resized);
            }
        }

        let embedded = self
            .encoder_dp
            .forward_t(&self.encoder_weight, input, train)?;
        let mut output = self.input_dp.forward_t(&embedded, train)?;

        let last = self.rnns.len() - 1;
        let mut new_hidden = Vec::with_capacity(self.rnns.len());
        for (l, (rnn, hidden_dp)) in self.rnns.iter().zip(&self.hidden_dps).enumerate() {
            let prev = self.hidden.as_ref().map(|h| &h[l]);
            let (out, state) = rnn.forward_t(&output, prev, train)?;
            new_hidden.push(state.detach());
            output = if l == last {
                out
            } else {
                hidden_dp.forward_t(&out, train)?
            };
        }
        self.hidden = Some(new_hidden);

        Ok(output)
    }

    fn output_size(&self) -> usize {
        self.config.emb_sz
    }

    fn embedding_weight(&self) -> Option<&Tensor> {
        Some(&self.encoder_weight)
    }
}

// ============================================================================
// Registry entry
// ============================================================================

fn lm_split(varmap: &VarMap) -> Result<Vec<Vec<Var>>> {
    let n_layers = count_indexed(varmap, "0.rnns.")?;
    let mut groups: Vec<Vec<String>> = (0..n_layers)
        .map(|l| vec![format!("0.rnns.{l}.")])
        .collect();
    groups.push(vec!["0.encoder.".to_string(), "1.".to_string()]);
    split_by_prefix(varmap, &groups)
}

fn clas_split(varmap: &VarMap) -> Result<Vec<Vec<Var>>> {
    let n_layers = count_indexed(varmap, "0.module.rnns.")?;
    let mut groups = vec![vec!["0.module.encoder.".to_string()]];
    groups.extend((0..n_layers).map(|l| vec![format!("0.module.rnns.{l}.")]));
    groups.push(vec!["1.".to_string()]);
    split_by_prefix(varmap, &groups)
}

/// Registry metadata for AWD-LSTM
pub fn awd_lstm_meta() -> ModelMeta {
    ModelMeta {
        hid_name: "emb_sz".to_string(),
        url: Some(WT103_FWD_URL.to_string()),
        url_bwd: Some(WT103_BWD_URL.to_string()),
        config_lm: awd_lstm_lm_config(),
        split_lm: lm_split,
        config_clas: awd_lstm_clas_config(),
        split_clas: clas_split,
        constructor: Arc::new(AwdLstm::from_config),
    }
}
