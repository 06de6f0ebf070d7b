//! Stage and architecture traits shared by every model
//!
//! A model is a pipeline of stages. Each stage declares whether it holds
//! recurrent state through the [`Reset`] trait; stateless stages are wrapped in
//! [`NoReset`] so the pipeline can reset every child uniformly.

use anyhow::Result;
use candle_core::Tensor;

/// A stage that can drop its recurrent state
pub trait Reset {
    fn reset(&mut self);
}

impl<T: Reset + ?Sized> Reset for Box<T> {
    fn reset(&mut self) {
        (**self).reset();
    }
}

/// One step of a model pipeline
///
/// `train` switches dropout and batch-norm statistics on.
pub trait Stage {
    type Input;
    type Output;

    fn forward_t(&mut self, input: &Self::Input, train: bool) -> Result<Self::Output>;
}

/// Recurrent encoder contract
///
/// Implementing this trait (plus [`Reset`]) is the only requirement for plugging
/// a new architecture into the model registry.
pub trait TextArch: Reset + Send {
    /// Encode token ids `[batch, seq]` (`U32`) into `[batch, seq, output_size]`.
    ///
    /// Recurrent state left by the previous call is carried forward until
    /// [`Reset::reset`] is called.
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor>;

    /// Width of the per-timestep output vector
    fn output_size(&self) -> usize;

    /// Input embedding matrix `[vocab, emb]`, if the architecture has one.
    ///
    /// Used for weight tying; the returned tensor shares storage with the
    /// underlying variable.
    fn embedding_weight(&self) -> Option<&Tensor> {
        None
    }
}

impl Stage for Box<dyn TextArch> {
    type Input = Tensor;
    type Output = Tensor;

    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.as_mut().forward_t(input, train)
    }
}

/// Adapter for stages without recurrent state; `reset` does nothing
#[derive(Debug, Clone)]
pub struct NoReset<M>(M);

impl<M> NoReset<M> {
    pub fn new(inner: M) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &M {
        &self.0
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.0
    }

    pub fn into_inner(self) -> M {
        self.0
    }
}

impl<M> Reset for NoReset<M> {
    fn reset(&mut self) {}
}

impl<M: Stage> Stage for NoReset<M> {
    type Input = M::Input;
    type Output = M::Output;

    fn forward_t(&mut self, input: &Self::Input, train: bool) -> Result<Self::Output> {
        self.0.forward_t(input, train)
    }
}

/// Output of a head stage
///
/// `raw` and `dropped` give loss and regularization code access to the
/// activations the head consumed, before and after its dropout.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// Logits `[batch, seq, vocab]` for a decoder, predictions `[batch, n_out]` for a classifier
    pub output: Tensor,
    /// Input to the head
    pub raw: Tensor,
    /// Input to the head after dropout
    pub dropped: Tensor,
}
