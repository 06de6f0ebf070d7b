// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ModelError in error.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! ulmfit-rs: recurrent language models and text classifiers
//!
//! Composes a recurrent encoder ("arch") with a task head. Classification
//! runs the arch over long documents in fixed-length chunks, carrying state
//! between chunks, and pools the result to one vector per document.
//!
//! ## Architecture
//!
//! - `model`: `Stage`, `Reset` and `TextArch` traits, `NoReset` adapter
//! - `sequential`: Two-stage pipeline with a uniform `reset`
//! - `awd_lstm`: AWD-LSTM encoder, the built-in registered arch
//! - `dropout`: RNN, embedding and weight dropout masks
//! - `decoder`: Per-token vocabulary head with optional weight tying
//! - `encoder`: Chunked sentence encoder over padded batches
//! - `masks`: Pad masks and masked fill
//! - `pooling`: Masked concat pooling (last, max, mean)
//! - `classifier`: Pooling classifier head (batch-norm, dropout, linear)
//! - `config`: Architecture config mapping and extracted settings
//! - `registry`: Architecture metadata and parameter-group splitters
//! - `builder`: `get_language_model` and `get_text_classifier`
//! - `error`: Typed assembly and pooling errors

pub mod awd_lstm;
pub mod builder;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod dropout;
pub mod encoder;
pub mod error;
pub mod masks;
pub mod model;
pub mod pooling;
pub mod registry;
pub mod sequential;

pub use awd_lstm::{AwdLstm, AwdLstmConfig, LstmState};
pub use builder::{
    get_language_model, get_text_classifier, ClassifierOptions, LanguageModel, LmOptions,
    TextClassifier,
};
pub use classifier::{LinBnDrop, PoolingLinearClassifier, SigmoidRange};
pub use config::{ArchConfig, ClassifierSettings, InitScheme, LmSettings};
pub use decoder::LinearDecoder;
pub use dropout::{dropout_mask, EmbeddingDropout, RnnDropout};
pub use encoder::{ChunkSpec, SentenceEncoder};
pub use error::ModelError;
pub use masks::{masked_fill, pad_mask, pads_per_row};
pub use model::{HeadOutput, NoReset, Reset, Stage, TextArch};
pub use pooling::masked_concat_pool;
pub use registry::{ArchConstructor, ModelMeta, ModelRegistry, ParamSplitter};
pub use sequential::SequentialRnn;
