//! Integration tests for ulmfit-rs
//!
//! Models are built with small AWD-LSTM configs on CPU so the whole suite
//! runs without a GPU or pretrained weights.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use tempfile::NamedTempFile;
use ulmfit_rs::{
    get_language_model, get_text_classifier, ArchConfig, AwdLstm, ClassifierOptions, LmOptions,
    ModelError, ModelRegistry, Reset, TextArch,
};

fn small_overrides() -> ArchConfig {
    ArchConfig::new()
        .with("emb_sz", 8)
        .with("n_hid", 12)
        .with("n_layers", 2)
}

fn random_tokens(bs: usize, sl: usize, vocab: u32, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let ids: Vec<u32> = (0..bs * sl).map(|_| rng.gen_range(2..vocab)).collect();
    Tensor::from_vec(ids, (bs, sl), &Device::Cpu).unwrap()
}

/// Config overrides loaded from a JSON file
#[test]
fn test_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"emb_sz": 8, "n_hid": 12, "n_layers": 2, "hidden_p": 0.5}}"#
    )
    .unwrap();

    let overrides = ArchConfig::from_json_file(file.path()).unwrap();
    assert_eq!(overrides.usize_value("emb_sz").unwrap(), 8);

    let registry = ModelRegistry::default();
    let merged = registry
        .meta("awd_lstm")
        .unwrap()
        .config_clas
        .merged(&overrides);
    assert_eq!(merged.f64_value("hidden_p").unwrap(), 0.5);
    assert_eq!(merged.f64_value("output_p").unwrap(), 0.4);
}

/// A config file that is not a JSON object is rejected
#[test]
fn test_config_file_not_object() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[1, 2, 3]").unwrap();
    assert!(ArchConfig::from_json_file(file.path()).is_err());
}

/// LM end to end with the built-in AWD-LSTM
#[test]
fn test_awd_lstm_language_model() {
    let registry = ModelRegistry::default();
    let base = registry.meta("awd_lstm").unwrap().config_lm.clone();
    let options = LmOptions {
        config: Some(base.merged(&small_overrides())),
        drop_mult: 0.5,
    };
    let varmap = VarMap::new();
    let mut model =
        get_language_model(&registry, "awd_lstm", 50, &options, &varmap, &Device::Cpu).unwrap();

    let input = random_tokens(3, 10, 50, 7);
    let out = model.forward(&input).unwrap();
    assert_eq!(out.output.dims(), &[3, 10, 50]);
    assert_eq!(out.raw.dims(), &[3, 10, 8]);

    // Training pass exercises every dropout path
    let out = model.forward_t(&input, true).unwrap();
    assert_eq!(out.output.dims(), &[3, 10, 50]);

    let groups = (registry.meta("awd_lstm").unwrap().split_lm)(&varmap).unwrap();
    let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
    // Two LSTM layers, then embedding + decoder bias (weight is tied)
    assert_eq!(sizes, vec![4, 4, 2]);
}

/// Writing the embedding through its Var is visible in the decoder
#[test]
fn test_tied_weights_write_through() {
    let registry = ModelRegistry::default();
    let base = registry.meta("awd_lstm").unwrap().config_lm.clone();
    let options = LmOptions {
        config: Some(base.merged(&small_overrides())),
        ..Default::default()
    };
    let varmap = VarMap::new();
    let model =
        get_language_model(&registry, "awd_lstm", 20, &options, &varmap, &Device::Cpu).unwrap();

    let embedding = varmap.data().lock().unwrap()["0.encoder.weight"].clone();
    embedding
        .set(&Tensor::full(0.25f32, (20, 8), &Device::Cpu).unwrap())
        .unwrap();

    let w: Vec<f32> = model
        .head()
        .inner()
        .weight()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert!(w.iter().all(|&v| v == 0.25));
}

/// Classifier end to end: long batch, chunked, pooled
#[test]
fn test_awd_lstm_classifier() {
    let registry = ModelRegistry::default();
    let options = ClassifierOptions {
        seq_len: 70,
        config: Some(small_overrides()),
        lin_ftrs: Some(vec![16]),
        ..Default::default()
    };
    let varmap = VarMap::new();
    let mut model =
        get_text_classifier(&registry, "awd_lstm", 40, 5, &options, &varmap, &Device::Cpu)
            .unwrap();

    let input = random_tokens(4, 140, 40, 11);
    let plan = model.encoder().chunk_plan(&input).unwrap();
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|c| c.len == 70 && c.active_rows == 4));

    let out = model.forward(&input).unwrap();
    assert_eq!(out.output.dims(), &[4, 5]);
    assert_eq!(out.raw.dims(), &[4, 140, 8]);

    let groups = (registry.meta("awd_lstm").unwrap().split_clas)(&varmap).unwrap();
    let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
    // Embedding, two LSTM layers, head (2 batch-norms + 2 linears)
    assert_eq!(sizes[0], 1);
    assert_eq!(&sizes[1..3], &[4, 4]);
    assert_eq!(sizes.len(), 4);
}

/// Encoding a short batch in one chunk equals a direct arch call
#[test]
fn test_classifier_encoder_matches_arch() {
    let registry = ModelRegistry::default();
    let options = ClassifierOptions {
        seq_len: 16,
        config: Some(small_overrides()),
        ..Default::default()
    };
    let varmap = VarMap::new();
    let mut model =
        get_text_classifier(&registry, "awd_lstm", 30, 2, &options, &varmap, &Device::Cpu)
            .unwrap();

    // Second arch on the same variables
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = registry
        .meta("awd_lstm")
        .unwrap()
        .config_clas
        .merged(&small_overrides())
        .without(&["output_p"])
        .deserialize()
        .unwrap();
    let mut direct = AwdLstm::new(30, config, vb.pp("0").pp("module")).unwrap();

    let input = random_tokens(2, 9, 30, 3);
    let out = model.forward(&input).unwrap();
    let expected = direct.forward_t(&input, false).unwrap();

    let diff: f32 = (&out.raw - &expected)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-6);
}

/// Rows padded at the front join at their first real chunk
#[test]
fn test_classifier_with_padded_rows() {
    let registry = ModelRegistry::default();
    let options = ClassifierOptions {
        seq_len: 4,
        config: Some(small_overrides()),
        ..Default::default()
    };
    let varmap = VarMap::new();
    let mut model =
        get_text_classifier(&registry, "awd_lstm", 30, 3, &options, &varmap, &Device::Cpu)
            .unwrap();

    let input = Tensor::new(
        &[
            [5u32, 6, 7, 8, 9, 10, 11, 12],
            [1, 1, 1, 1, 9, 10, 11, 12],
        ],
        &Device::Cpu,
    )
    .unwrap();
    let plan = model.encoder().chunk_plan(&input).unwrap();
    let active: Vec<usize> = plan.iter().map(|c| c.active_rows).collect();
    assert_eq!(active, vec![1, 2]);

    let out = model.forward(&input).unwrap();
    assert_eq!(out.output.dims(), &[2, 3]);

    // Zero rows stand in for the chunk row 1 skipped
    let skipped: f32 = out
        .raw
        .i((1, 0..4))
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(skipped, 0.0);
}

/// reset() on an assembled model clears the arch state
#[test]
fn test_reset_clears_lm_state() {
    let registry = ModelRegistry::default();
    let base = registry.meta("awd_lstm").unwrap().config_lm.clone();
    let options = LmOptions {
        config: Some(base.merged(&small_overrides())),
        ..Default::default()
    };
    let varmap = VarMap::new();
    let mut model =
        get_language_model(&registry, "awd_lstm", 20, &options, &varmap, &Device::Cpu).unwrap();

    let input = random_tokens(2, 5, 20, 1);
    let first = model.forward(&input).unwrap().output;
    let carried = model.forward(&input).unwrap().output;
    model.reset();
    let fresh = model.forward(&input).unwrap().output;

    let max_diff = |a: &Tensor, b: &Tensor| -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    };
    assert!(max_diff(&first, &fresh) < 1e-6);
    assert!(max_diff(&first, &carried) > 0.0);
}

#[test]
fn test_unknown_architecture() {
    let registry = ModelRegistry::default();
    let err = get_text_classifier(
        &registry,
        "transformer",
        30,
        2,
        &ClassifierOptions::default(),
        &VarMap::new(),
        &Device::Cpu,
    )
    .err()
    .unwrap();
    assert_eq!(
        err.downcast_ref::<ModelError>(),
        Some(&ModelError::UnknownArchitecture("transformer".to_string()))
    );
}

#[test]
fn test_head_layer_mismatch() {
    let registry = ModelRegistry::default();
    let options = ClassifierOptions {
        config: Some(small_overrides()),
        lin_ftrs: Some(vec![30, 20]),
        ps: Some(vec![0.1]),
        ..Default::default()
    };
    let err = get_text_classifier(&registry, "awd_lstm", 30, 2, &options, &VarMap::new(), &Device::Cpu)
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::LayerMismatch { .. })
    ));
}
