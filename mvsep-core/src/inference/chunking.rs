//! Chunk geometry and the cross-faded output buffer.

use crate::{audio::Waveform, Result, SeparationError};

/// Where the chunks of a signal start.
///
/// Chunks of `chunk_size` samples start at `0, S, 2S, …` with stride
/// `S = chunk_size - overlap`, for as long as the whole chunk fits. Without
/// `pad_tail` the samples after the last full chunk are not covered; with it
/// the signal is treated as zero-extended so one more chunk reaches the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total: usize,
    chunk_size: usize,
    overlap: usize,
    padded: usize,
}

impl ChunkPlan {
    pub fn new(total: usize, chunk_size: usize, overlap: usize, pad_tail: bool) -> Result<Self> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(SeparationError::Config(format!(
                "overlap {overlap} must be smaller than chunk_size {chunk_size}"
            )));
        }
        let mut plan = Self {
            total,
            chunk_size,
            overlap,
            padded: total,
        };
        if pad_tail && total > 0 {
            plan.padded = match plan.count_for(total) {
                0 => chunk_size,
                n if plan.end_of(n - 1) >= total => total,
                n => plan.end_of(n),
            };
        }
        Ok(plan)
    }

    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Length of the input signal.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Length the signal is processed at (`total` unless the tail is padded).
    pub fn padded_len(&self) -> usize {
        self.padded
    }

    /// Number of chunks: `(len - overlap) / stride`, or 0 if not even one fits.
    pub fn count(&self) -> usize {
        self.count_for(self.padded)
    }

    pub fn starts(&self) -> impl Iterator<Item = usize> {
        let stride = self.stride();
        (0..self.count()).map(move |k| k * stride)
    }

    /// Index of the last input sample covered by a chunk.
    pub fn last_sample(&self) -> Option<usize> {
        match self.count() {
            0 => None,
            n => Some((self.end_of(n - 1) - 1).min(self.total.saturating_sub(1))),
        }
    }

    /// Input samples after the last chunk, which stay silent in the output.
    pub fn dropped_tail(&self) -> usize {
        match self.last_sample() {
            Some(last) => self.total - (last + 1),
            None => self.total,
        }
    }

    fn count_for(&self, len: usize) -> usize {
        if len < self.chunk_size {
            0
        } else {
            (len - self.overlap) / self.stride()
        }
    }

    /// One past the last sample of chunk `k`.
    fn end_of(&self, k: usize) -> usize {
        k * self.stride() + self.chunk_size
    }
}

/// The output buffer of a chunked inference run.
///
/// Only this type touches the buffer. Chunks must arrive in order; the first
/// one is written as is. Each later chunk blends its first `overlap / 2`
/// samples with what is already there (linear fade-out on the buffer, linear
/// fade-in on the chunk, weights summing to one) and overwrites the rest.
#[derive(Debug)]
pub struct OverlapAdd {
    buffer: Vec<Vec<f32>>,
    sample_rate: u32,
    chunk_size: usize,
    fade_in: Vec<f32>,
    next_start: usize,
    chunks: usize,
}

impl OverlapAdd {
    pub fn new(
        channels: usize,
        len: usize,
        chunk_size: usize,
        overlap: usize,
        sample_rate: u32,
    ) -> Self {
        let crossfade = overlap / 2;
        // endpoints included: 0 at the first sample, 1 at the last
        let fade_in = (0..crossfade)
            .map(|j| {
                if crossfade == 1 {
                    0.0
                } else {
                    j as f32 / (crossfade - 1) as f32
                }
            })
            .collect();
        Self {
            buffer: vec![vec![0.0; len]; channels],
            sample_rate,
            chunk_size,
            fade_in,
            next_start: 0,
            chunks: 0,
        }
    }

    pub fn crossfade_len(&self) -> usize {
        self.fade_in.len()
    }

    /// Number of chunks written so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Stitch `chunk`, which covers `[start, start + chunk_size)`.
    pub fn add(&mut self, start: usize, chunk: &Waveform) -> Result<()> {
        let len = self.buffer.first().map_or(0, Vec::len);
        if chunk.num_channels() != self.buffer.len() || chunk.len() != self.chunk_size {
            return Err(SeparationError::Shape(format!(
                "chunk of {} channels x {} samples, expected {} x {}",
                chunk.num_channels(),
                chunk.len(),
                self.buffer.len(),
                self.chunk_size
            )));
        }
        if start + self.chunk_size > len {
            return Err(SeparationError::Shape(format!(
                "chunk [{start}, {}) exceeds output of {len} samples",
                start + self.chunk_size
            )));
        }
        if start < self.next_start {
            return Err(SeparationError::Shape(format!(
                "chunk at {start} arrived after a chunk reaching {}",
                self.next_start
            )));
        }

        let blend = if self.chunks == 0 { 0 } else { self.crossfade_len() };
        for (out, new) in self.buffer.iter_mut().zip(chunk.channels()) {
            let region = &mut out[start..start + self.chunk_size];
            for ((o, &n), &w) in region.iter_mut().zip(new).zip(&self.fade_in[..blend]) {
                *o = *o * (1.0 - w) + n * w;
            }
            region[blend..].copy_from_slice(&new[blend..]);
        }

        self.next_start = start + 1;
        self.chunks += 1;
        Ok(())
    }

    /// Finish the run, clamping every sample to `[-1, 1]`.
    pub fn into_clipped(self) -> Result<Waveform> {
        let channels = self
            .buffer
            .into_iter()
            .map(|c| c.into_iter().map(|x| x.clamp(-1.0, 1.0)).collect())
            .collect();
        Waveform::new(channels, self.sample_rate)
    }
}
