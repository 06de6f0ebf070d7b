//! Chunked sentence encoder
//!
//! Runs a recurrent architecture over a long padded batch `bptt` tokens at a
//! time. Recurrent state carries from one chunk to the next and is reset at
//! the start of every call, so one call encodes one batch of documents.
//!
//! ## Batch layout
//!
//! Rows are sorted longest first and padded at the front in whole chunks.
//! A row joins the computation at the first chunk where its first column is
//! not padding, and from then on it is among the leading `active_rows` rows,
//! so each chunk feeds only `input[..active_rows, offset..offset + len]`.
//!
//! ```text
//! bptt = 3, pad = 1
//! [[5, 6, 7, 8, 9, 4],      chunk 0: 2 active rows
//!  [2, 3, 4, 5, 6, 7],      chunk 1: 3 active rows
//!  [1, 1, 1, 8, 9, 3]]
//! ```

use anyhow::{bail, ensure, Result};
use candle_core::{DType, IndexOp, Tensor};
use tracing::debug;

use crate::masks::pad_mask;
use crate::model::{Reset, Stage, TextArch};

/// Where one chunk sits in the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// First column of the chunk
    pub offset: usize,
    /// Number of columns (`bptt`, or fewer for the last chunk)
    pub len: usize,
    /// Rows whose token at `offset` is not padding
    pub active_rows: usize,
    /// Whether the chunk's output is part of the result
    pub retained: bool,
}

/// Wraps an architecture and feeds it a batch chunk by chunk
pub struct SentenceEncoder {
    bptt: usize,
    module: Box<dyn TextArch>,
    pad_idx: u32,
    max_len: Option<usize>,
}

impl SentenceEncoder {
    /// Create an encoder
    ///
    /// # Arguments
    /// * `bptt` - Chunk length
    /// * `module` - Architecture fed one chunk at a time
    /// * `pad_idx` - Padding token id
    /// * `max_len` - Keep only the chunks within the last `max_len` tokens
    pub fn new(
        bptt: usize,
        module: Box<dyn TextArch>,
        pad_idx: u32,
        max_len: Option<usize>,
    ) -> Result<Self> {
        ensure!(bptt > 0, "bptt must be positive");
        Ok(Self {
            bptt,
            module,
            pad_idx,
            max_len,
        })
    }

    pub fn bptt(&self) -> usize {
        self.bptt
    }

    pub fn pad_idx(&self) -> u32 {
        self.pad_idx
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    pub fn module(&self) -> &dyn TextArch {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn TextArch {
        self.module.as_mut()
    }

    /// Chunk layout for a `[batch, seq_len]` token batch
    pub fn chunk_plan(&self, input: &Tensor) -> Result<Vec<ChunkSpec>> {
        let (_bs, sl) = input.dims2()?;
        let mut plan = Vec::with_capacity(sl.div_ceil(self.bptt));
        for offset in (0..sl).step_by(self.bptt) {
            let column: Vec<u32> = input.i((.., offset))?.to_dtype(DType::U32)?.to_vec1()?;
            let active_rows = column.iter().filter(|&&t| t != self.pad_idx).count();
            plan.push(ChunkSpec {
                offset,
                len: self.bptt.min(sl - offset),
                active_rows,
                retained: self.max_len.map_or(true, |m| sl - offset <= m),
            });
        }
        Ok(plan)
    }
}

impl Reset for SentenceEncoder {
    fn reset(&mut self) {
        self.module.reset();
    }
}

/// Append zero rows so `t` has `bs` rows
fn pad_rows(t: &Tensor, bs: usize) -> Result<Tensor> {
    let (rows, len, hidden) = t.dims3()?;
    if rows >= bs {
        return Ok(t.clone());
    }
    let zeros = Tensor::zeros((bs - rows, len, hidden), t.dtype(), t.device())?;
    Ok(Tensor::cat(&[t, &zeros], 0)?)
}

impl Stage for SentenceEncoder {
    type Input = Tensor;
    /// (output `[bs, retained, hidden]`, pad mask `[bs, retained]`)
    type Output = (Tensor, Tensor);

    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (bs, sl) = input.dims2()?;
        ensure!(bs > 0 && sl > 0, "Cannot encode an empty batch [{bs}, {sl}]");

        self.module.reset();
        let mask = pad_mask(input, self.pad_idx)?;

        let mut outs = Vec::new();
        let mut masks = Vec::new();
        for chunk in self.chunk_plan(input)? {
            debug!(
                "Chunk at {}: len={}, active_rows={}, retained={}",
                chunk.offset, chunk.len, chunk.active_rows, chunk.retained
            );
            let out = if chunk.active_rows == 0 {
                // Nothing to run; state stays as the previous chunk left it
                Tensor::zeros(
                    (bs, chunk.len, self.module.output_size()),
                    DType::F32,
                    input.device(),
                )?
            } else {
                let rows = input
                    .narrow(0, 0, chunk.active_rows)?
                    .narrow(1, chunk.offset, chunk.len)?
                    .contiguous()?;
                let out = self.module.forward_t(&rows, train)?;
                pad_rows(&out, bs)?
            };
            if chunk.retained {
                outs.push(out);
                masks.push(mask.narrow(1, chunk.offset, chunk.len)?);
            }
        }

        if outs.is_empty() {
            bail!(
                "No chunk retained: sequence length {sl}, max_len {:?}",
                self.max_len
            );
        }
        let output = Tensor::cat(&outs, 1)?;
        let mask = Tensor::cat(&masks, 1)?;
        Ok((output, mask))
    }
}
