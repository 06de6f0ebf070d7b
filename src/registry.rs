//! Architecture metadata registry
//!
//! Maps an architecture name to everything model assembly needs to know about
//! it: which config key holds its output width, its default configs, how to
//! build it, and how to split its parameters into training groups.

use anyhow::Result;
use candle_core::Var;
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::awd_lstm;
use crate::config::ArchConfig;
use crate::error::ModelError;
use crate::model::TextArch;

/// Builds an architecture from a vocabulary size and its remaining config
pub type ArchConstructor =
    Arc<dyn Fn(usize, &ArchConfig, VarBuilder) -> Result<Box<dyn TextArch>> + Send + Sync>;

/// Splits an assembled model's variables into parameter groups
///
/// Used by training loops for discriminative learning rates and gradual
/// unfreezing.
pub type ParamSplitter = fn(&VarMap) -> Result<Vec<Vec<Var>>>;

/// Everything the model builders need to know about one architecture
#[derive(Clone)]
pub struct ModelMeta {
    /// Config key holding the arch's output width
    pub hid_name: String,
    /// Pretrained forward weights
    pub url: Option<String>,
    /// Pretrained backward weights
    pub url_bwd: Option<String>,
    pub config_lm: ArchConfig,
    pub split_lm: ParamSplitter,
    pub config_clas: ArchConfig,
    pub split_clas: ParamSplitter,
    pub constructor: ArchConstructor,
}

impl fmt::Debug for ModelMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMeta")
            .field("hid_name", &self.hid_name)
            .field("url", &self.url)
            .field("url_bwd", &self.url_bwd)
            .field("config_lm", &self.config_lm)
            .field("config_clas", &self.config_clas)
            .finish_non_exhaustive()
    }
}

/// Name → metadata lookup
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelMeta>,
}

impl ModelRegistry {
    /// Registry with no architectures
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Add or replace an architecture
    pub fn register(&mut self, name: &str, meta: ModelMeta) {
        self.models.insert(name.to_string(), meta);
    }

    pub fn meta(&self, name: &str) -> Result<&ModelMeta> {
        self.models
            .get(name)
            .ok_or_else(|| ModelError::UnknownArchitecture(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModelRegistry {
    /// Registry with the built-in architectures (`awd_lstm`)
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(awd_lstm::ARCH_NAME, awd_lstm::awd_lstm_meta());
        registry
    }
}

/// Group variables by name prefix
///
/// Each variable goes to the first group with a matching prefix; variables
/// matching no group are dropped. Groups are sorted by variable name.
pub fn split_by_prefix(varmap: &VarMap, groups: &[Vec<String>]) -> Result<Vec<Vec<Var>>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = vec![Vec::new(); groups.len()];
    for (name, var) in named {
        if let Some(g) = groups
            .iter()
            .position(|prefixes| prefixes.iter().any(|p| name.starts_with(p.as_str())))
        {
            out[g].push(var.clone());
        }
    }
    Ok(out)
}

/// Number of distinct `{prefix}{i}.` indices among the variable names
pub fn count_indexed(varmap: &VarMap, prefix: &str) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
    let max = data
        .keys()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
        .max();
    Ok(max.map_or(0, |m| m + 1))
}
