//! Model assembly
//!
//! [`get_language_model`] and [`get_text_classifier`] turn an architecture
//! name plus options into a two-stage [`SequentialRnn`]. Variables are created
//! in the caller's `VarMap` with fastai's state-dict layout:
//!
//! | Model      | Encoder prefix | Head prefix |
//! |------------|----------------|-------------|
//! | LM         | `0.`           | `1.`        |
//! | Classifier | `0.module.`    | `1.`        |

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::classifier::PoolingLinearClassifier;
use crate::config::{ArchConfig, ClassifierSettings, InitScheme, LmSettings};
use crate::decoder::LinearDecoder;
use crate::encoder::SentenceEncoder;
use crate::model::{NoReset, TextArch};
use crate::registry::ModelRegistry;
use crate::sequential::SequentialRnn;

/// Architecture feeding a per-token decoder
pub type LanguageModel = SequentialRnn<Box<dyn TextArch>, NoReset<LinearDecoder>>;

/// Chunked encoder feeding a pooling classifier
pub type TextClassifier = SequentialRnn<SentenceEncoder, NoReset<PoolingLinearClassifier>>;

/// Options for [`get_language_model`]
#[derive(Debug, Clone)]
pub struct LmOptions {
    /// Replaces the registered LM config when set
    pub config: Option<ArchConfig>,
    /// Multiplier for every `*_p` entry
    pub drop_mult: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            config: None,
            drop_mult: 1.0,
        }
    }
}

/// Options for [`get_text_classifier`]
#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    /// Chunk length for the sentence encoder
    pub seq_len: usize,
    /// Merged over the registered classifier config
    pub config: Option<ArchConfig>,
    pub drop_mult: f64,
    /// Hidden widths of the head (default `[50]`)
    pub lin_ftrs: Option<Vec<usize>>,
    /// Dropout per hidden layer (default 0.1 each)
    pub ps: Option<Vec<f64>>,
    pub pad_idx: u32,
    pub max_len: Option<usize>,
    pub y_range: Option<(f64, f64)>,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            seq_len: 72,
            config: None,
            drop_mult: 1.0,
            lin_ftrs: None,
            ps: None,
            pad_idx: 1,
            max_len: Some(72 * 20),
            y_range: None,
        }
    }
}

fn var_names(varmap: &VarMap) -> Result<HashSet<String>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock poisoned"))?;
    Ok(data.keys().cloned().collect())
}

/// Variables added to `varmap` since `before` was taken
fn vars_since(varmap: &VarMap, before: &HashSet<String>) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock poisoned"))?;
    let mut added: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !before.contains(*name))
        .collect();
    added.sort_by(|a, b| a.0.cmp(b.0));
    Ok(added.into_iter().map(|(_, v)| v.clone()).collect())
}

fn apply_init(
    init: Option<InitScheme>,
    varmap: &VarMap,
    before: &HashSet<String>,
) -> Result<()> {
    if let Some(init) = init {
        let written = init.apply(&vars_since(varmap, before)?)?;
        debug!("Applied {:?} to {} weight matrices", init, written);
    }
    Ok(())
}

/// Build a language model
///
/// # Arguments
/// * `registry` - Architecture metadata
/// * `arch` - Registered architecture name
/// * `vocab_sz` - Vocabulary size
/// * `options` - Config override and dropout multiplier
/// * `varmap` - Receives the new variables
/// * `device` - Device for the new variables
///
/// # Errors
/// `ModelError::UnknownArchitecture` if `arch` is not registered, or a config
/// error if a required key is missing.
pub fn get_language_model(
    registry: &ModelRegistry,
    arch: &str,
    vocab_sz: usize,
    options: &LmOptions,
    varmap: &VarMap,
    device: &Device,
) -> Result<LanguageModel> {
    let meta = registry.meta(arch)?;
    let config = options
        .config
        .as_ref()
        .unwrap_or(&meta.config_lm)
        .scale_dropouts(options.drop_mult)?;
    let settings = LmSettings::extract(&config, &meta.hid_name)?;

    let before = var_names(varmap)?;
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

    let encoder = (meta.constructor)(vocab_sz, &settings.arch, vb.pp("0"))?;
    let tie_encoder = if settings.tie_weights {
        Some(
            encoder
                .embedding_weight()
                .ok_or_else(|| anyhow!("Architecture '{arch}' has no embedding to tie to"))?,
        )
    } else {
        None
    };
    let decoder = LinearDecoder::new(
        vocab_sz,
        settings.hidden_size,
        settings.output_p,
        tie_encoder,
        settings.out_bias,
        vb.pp("1"),
    )?;

    apply_init(settings.init, varmap, &before)?;

    info!(
        "Language model: arch={}, vocab={}, hidden={}, tied={}, drop_mult={}",
        arch,
        vocab_sz,
        settings.hidden_size,
        decoder.is_tied(),
        options.drop_mult
    );

    Ok(SequentialRnn::new(encoder, NoReset::new(decoder)))
}

/// Build a text classifier
///
/// Head widths are `[3 * hidden] + lin_ftrs + [n_class]`, with dropouts
/// `[output_p] + ps`.
///
/// # Errors
/// `ModelError::UnknownArchitecture` for an unregistered `arch`,
/// `ModelError::LayerMismatch` if `lin_ftrs` and `ps` differ in length.
pub fn get_text_classifier(
    registry: &ModelRegistry,
    arch: &str,
    vocab_sz: usize,
    n_class: usize,
    options: &ClassifierOptions,
    varmap: &VarMap,
    device: &Device,
) -> Result<TextClassifier> {
    let meta = registry.meta(arch)?;
    let config = match &options.config {
        Some(overrides) => meta.config_clas.merged(overrides),
        None => meta.config_clas.clone(),
    }
    .scale_dropouts(options.drop_mult)?;
    let settings = ClassifierSettings::extract(&config, &meta.hid_name)?;

    let lin_ftrs = options.lin_ftrs.clone().unwrap_or_else(|| vec![50]);
    let extra_ps = options
        .ps
        .clone()
        .unwrap_or_else(|| vec![0.1; lin_ftrs.len()]);

    let mut layers = Vec::with_capacity(lin_ftrs.len() + 2);
    layers.push(settings.hidden_size * 3);
    layers.extend(&lin_ftrs);
    layers.push(n_class);
    let mut ps = Vec::with_capacity(extra_ps.len() + 1);
    ps.push(settings.output_p);
    ps.extend(&extra_ps);

    let before = var_names(varmap)?;
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

    // Head first: a layer/dropout mismatch fails before any arch variable exists
    let head = PoolingLinearClassifier::new(&layers, &ps, options.seq_len, options.y_range, vb.pp("1"))?;
    let module = (meta.constructor)(vocab_sz, &settings.arch, vb.pp("0").pp("module"))?;
    let encoder = SentenceEncoder::new(options.seq_len, module, options.pad_idx, options.max_len)?;

    apply_init(settings.init, varmap, &before)?;

    info!(
        "Text classifier: arch={}, vocab={}, classes={}, layers={:?}, bptt={}, max_len={:?}",
        arch, vocab_sz, n_class, layers, options.seq_len, options.max_len
    );

    Ok(SequentialRnn::new(encoder, NoReset::new(head)))
}
