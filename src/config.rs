//! Model configuration
//!
//! An [`ArchConfig`] is an ordered option-name → JSON-value mapping, the form
//! registered defaults and user overrides come in. Model assembly never mutates
//! it in place: it scales the dropout entries into a new mapping, then extracts
//! the keys it owns into an immutable settings struct ([`LmSettings`],
//! [`ClassifierSettings`]) whose `arch` field holds what is left for the
//! architecture constructor.

use anyhow::{Context, Result};
use candle_core::Var;
use candle_nn::Init;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::ModelError;

/// Keys ending in this suffix are dropout probabilities
pub const DROPOUT_SUFFIX: &str = "_p";

/// Option-name → value mapping for an architecture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchConfig(Map<String, Value>);

impl ArchConfig {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Load a config from a JSON object file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Self::from_value(value)
    }

    /// Build from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => anyhow::bail!("Config must be a JSON object, got {other}"),
        }
    }

    /// Builder-style insert
    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of `self` with every key of `overrides` replaced or added
    pub fn merged(&self, overrides: &ArchConfig) -> Self {
        let mut map = self.0.clone();
        for (k, v) in &overrides.0 {
            map.insert(k.clone(), v.clone());
        }
        Self(map)
    }

    /// Copy of `self` with every dropout entry multiplied by `mult`
    pub fn scale_dropouts(&self, mult: f64) -> Result<Self> {
        let mut map = self.0.clone();
        for (k, v) in &mut map {
            if !k.ends_with(DROPOUT_SUFFIX) {
                continue;
            }
            let p = v.as_f64().ok_or_else(|| ModelError::InvalidValue {
                key: k.clone(),
                expected: "a number",
            })?;
            *v = Value::from(p * mult);
        }
        Ok(Self(map))
    }

    /// Copy of `self` without `keys`
    pub fn without(&self, keys: &[&str]) -> Self {
        let mut map = self.0.clone();
        for k in keys {
            map.remove(*k);
        }
        Self(map)
    }

    fn required(&self, key: &str) -> Result<&Value> {
        self.0
            .get(key)
            .ok_or_else(|| ModelError::MissingKey(key.to_string()).into())
    }

    pub fn usize_value(&self, key: &str) -> Result<usize> {
        self.required(key)?
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| invalid(key, "a non-negative integer"))
    }

    pub fn f64_value(&self, key: &str) -> Result<f64> {
        self.required(key)?
            .as_f64()
            .ok_or_else(|| invalid(key, "a number"))
    }

    pub fn bool_value(&self, key: &str) -> Result<bool> {
        self.required(key)?
            .as_bool()
            .ok_or_else(|| invalid(key, "a boolean"))
    }

    /// Deserialize into a typed architecture config
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .context("Failed to parse architecture config")
    }
}

fn invalid(key: &str, expected: &'static str) -> anyhow::Error {
    ModelError::InvalidValue {
        key: key.to_string(),
        expected,
    }
    .into()
}

fn optional_init(config: &ArchConfig) -> Result<Option<InitScheme>> {
    config
        .get("init")
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|_| invalid("init", "an init scheme object such as {\"kind\": \"uniform\", \"bound\": 0.1}"))
        })
        .transpose()
}

/// Settings extracted for a language model
#[derive(Debug, Clone, PartialEq)]
pub struct LmSettings {
    /// Width of the arch output, read from the key named by the registry
    pub hidden_size: usize,
    pub tie_weights: bool,
    pub output_p: f64,
    pub out_bias: bool,
    pub init: Option<InitScheme>,
    /// Remaining options, passed to the arch constructor
    pub arch: ArchConfig,
}

impl LmSettings {
    pub const CONSUMED_KEYS: [&'static str; 4] = ["tie_weights", "output_p", "out_bias", "init"];

    pub fn extract(config: &ArchConfig, hid_name: &str) -> Result<Self> {
        Ok(Self {
            hidden_size: config.usize_value(hid_name)?,
            tie_weights: config.bool_value("tie_weights")?,
            output_p: config.f64_value("output_p")?,
            out_bias: config.bool_value("out_bias")?,
            init: optional_init(config)?,
            arch: config.without(&Self::CONSUMED_KEYS),
        })
    }
}

/// Settings extracted for a text classifier
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    pub hidden_size: usize,
    /// Dropout before the first head layer
    pub output_p: f64,
    pub init: Option<InitScheme>,
    pub arch: ArchConfig,
}

impl ClassifierSettings {
    pub const CONSUMED_KEYS: [&'static str; 2] = ["output_p", "init"];

    pub fn extract(config: &ArchConfig, hid_name: &str) -> Result<Self> {
        Ok(Self {
            hidden_size: config.usize_value(hid_name)?,
            output_p: config.f64_value("output_p")?,
            init: optional_init(config)?,
            arch: config.without(&Self::CONSUMED_KEYS),
        })
    }
}

/// Weight initializer applied after assembly
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitScheme {
    Uniform { bound: f64 },
    Normal { std: f64 },
    KaimingNormal,
    Zeros,
}

impl InitScheme {
    pub fn to_init(self) -> Init {
        match self {
            InitScheme::Uniform { bound } => Init::Uniform {
                lo: -bound,
                up: bound,
            },
            InitScheme::Normal { std } => Init::Randn {
                mean: 0.0,
                stdev: std,
            },
            InitScheme::KaimingNormal => candle_nn::init::DEFAULT_KAIMING_NORMAL,
            InitScheme::Zeros => Init::Const(0.0),
        }
    }

    /// Re-initialize every weight matrix (rank >= 2) among `vars`
    ///
    /// Vectors (biases, batch-norm statistics) are left alone. Returns the
    /// number of variables written.
    pub fn apply(self, vars: &[Var]) -> Result<usize> {
        let init = self.to_init();
        let mut written = 0;
        for var in vars.iter().filter(|v| v.rank() >= 2) {
            let fresh = init.var(var.shape().clone(), var.dtype(), var.device())?;
            var.set(fresh.as_tensor())?;
            written += 1;
        }
        Ok(written)
    }
}
