//! Two-stage model pipeline
//!
//! An encoder stage feeds a head stage; `reset` reaches both.

use anyhow::Result;

use crate::model::{Reset, Stage};

/// Encoder followed by a head, with reset passed to both children
#[derive(Debug)]
pub struct SequentialRnn<E, H> {
    encoder: E,
    head: H,
}

impl<E, H> SequentialRnn<E, H>
where
    E: Stage + Reset,
    H: Stage<Input = E::Output> + Reset,
{
    pub fn new(encoder: E, head: H) -> Self {
        Self { encoder, head }
    }

    /// Run both stages in order
    pub fn forward_t(&mut self, input: &E::Input, train: bool) -> Result<H::Output> {
        let hidden = self.encoder.forward_t(input, train)?;
        self.head.forward_t(&hidden, train)
    }

    /// Inference forward pass (dropout off, batch-norm uses running statistics)
    pub fn forward(&mut self, input: &E::Input) -> Result<H::Output> {
        self.forward_t(input, false)
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn head(&self) -> &H {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut H {
        &mut self.head
    }

    pub fn into_parts(self) -> (E, H) {
        (self.encoder, self.head)
    }
}

impl<E: Reset, H: Reset> Reset for SequentialRnn<E, H> {
    fn reset(&mut self) {
        self.encoder.reset();
        self.head.reset();
    }
}
