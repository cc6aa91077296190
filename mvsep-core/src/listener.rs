//! Observers for training and chunked inference.
//!
//! Events are small and carry no tensors: enough for progress bars and
//! debugging. Summary statistics are only computed when the listener asks for
//! them, because that costs a pass over the data.

use std::{fmt, path::PathBuf};

use tracing::{debug, info};

/// Summary statistics of a block of values.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalStats {
    pub len: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl fmt::Display for SignalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={:<9} min={:+.6} max={:+.6} mean={:+.6} std={:.6}",
            self.len, self.min, self.max, self.mean, self.std,
        )
    }
}

/// Statistics of one inference chunk.
#[derive(Debug, Clone)]
pub struct ChunkStats {
    pub normalized_input: SignalStats,
    pub predicted_magnitude: SignalStats,
    /// The phase head output. It does not contribute to the separated signal.
    pub predicted_phase: SignalStats,
    pub residual_magnitude: SignalStats,
}

#[derive(Debug)]
pub enum PipelineEvent {
    /// Chunked inference is about to process `chunks` chunks.
    InferenceStarted {
        total_samples: usize,
        chunks: usize,
        dropped_tail: usize,
    },

    /// A chunk was separated and stitched into the output.
    ChunkDone {
        index: usize,
        total: usize,
        stats: Option<ChunkStats>,
    },

    InferenceDone { samples: usize },

    TrainingStarted {
        start_step: usize,
        total_steps: usize,
        batches_per_epoch: usize,
    },

    /// State was restored from a checkpoint.
    Resumed { step: usize, avg_loss: f64 },

    EpochStarted { epoch: usize, epochs: usize },

    /// One optimizer step finished. `skipped` means the gradients overflowed
    /// and the update was not applied.
    StepDone {
        step: usize,
        total_steps: usize,
        epoch: usize,
        loss: f32,
        avg_loss: f64,
        lr: f64,
        skipped: bool,
    },

    CheckpointSaved { step: usize, path: PathBuf },

    TrainingDone { steps: usize, avg_loss: f64 },
}

/// Implement this for UI, logging, etc.
pub trait PipelineListener {
    fn on_event(&mut self, event: PipelineEvent);

    /// Return `true` to receive statistics in events.
    fn wants_stats(&self) -> bool {
        false
    }
}

/// No-op listener; compiles to nothing when monomorphized.
pub struct NoOpListener;

impl PipelineListener for NoOpListener {
    #[inline(always)]
    fn on_event(&mut self, _event: PipelineEvent) {}
}

/// Logs every event through `tracing`, with statistics.
pub struct DebugListener;

impl PipelineListener for DebugListener {
    fn on_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::InferenceStarted {
                total_samples,
                chunks,
                dropped_tail,
            } => info!(total_samples, chunks, dropped_tail, "inference started"),
            PipelineEvent::ChunkDone {
                index,
                total,
                stats,
            } => match stats {
                Some(s) => debug!(
                    "chunk {}/{total}\n  input     {}\n  pred mag  {}\n  pred phs  {}\n  residual  {}",
                    index + 1,
                    s.normalized_input,
                    s.predicted_magnitude,
                    s.predicted_phase,
                    s.residual_magnitude
                ),
                None => debug!("chunk {}/{total}", index + 1),
            },
            PipelineEvent::InferenceDone { samples } => info!(samples, "inference done"),
            PipelineEvent::TrainingStarted {
                start_step,
                total_steps,
                batches_per_epoch,
            } => info!(start_step, total_steps, batches_per_epoch, "training started"),
            PipelineEvent::Resumed { step, avg_loss } => {
                info!(step, avg_loss, "resumed from checkpoint")
            }
            PipelineEvent::EpochStarted { epoch, epochs } => {
                debug!("epoch {}/{epochs}", epoch + 1)
            }
            PipelineEvent::StepDone {
                step,
                total_steps,
                epoch,
                loss,
                avg_loss,
                lr,
                skipped,
            } => debug!(step, total_steps, epoch, loss, avg_loss, lr, skipped, "step"),
            PipelineEvent::CheckpointSaved { step, path } => {
                info!(step, path = %path.display(), "checkpoint")
            }
            PipelineEvent::TrainingDone { steps, avg_loss } => {
                info!(steps, avg_loss, "training done")
            }
        }
    }

    fn wants_stats(&self) -> bool {
        true
    }
}

/// Compute summary statistics in one pass (f64 accumulators).
pub fn signal_stats(values: &[f32]) -> SignalStats {
    if values.is_empty() {
        return SignalStats {
            len: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
        };
    }
    let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for &x in values {
        min = min.min(x);
        max = max.max(x);
        sum += x as f64;
        sum_sq += (x as f64) * (x as f64);
    }
    let n = values.len() as f64;
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    SignalStats {
        len: values.len(),
        min,
        max,
        mean: mean as f32,
        std: var.sqrt() as f32,
    }
}
