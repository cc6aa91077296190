//! Multi-worker batch loading with bounded prefetch.
//!
//! Each epoch spawns `num_workers` threads. They pull track indices from a
//! shared job queue in shuffled order and push finished samples into a
//! bounded channel, so at most `prefetch * batch_size` samples wait for the
//! training step. Samples arrive in completion order.

use std::{sync::Arc, thread};

use burn::{prelude::Backend, tensor::TensorData, Tensor};
use crossbeam_channel::{bounded, unbounded, Receiver};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, error};

use super::segmenter::{Sample, TrackDataset};
use crate::{dsp::Spectral, Result, SeparationError};

/// A collated group of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Normalized mixture magnitudes as `[batch, channels, bins, frames]`.
    pub fn mixture<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>> {
        stack(self.samples.iter().map(|s| &s.mixture), device)
    }

    /// Normalized target magnitudes as `[batch, channels, bins, frames]`.
    pub fn target<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>> {
        stack(self.samples.iter().map(|s| &s.target), device)
    }
}

fn stack<'a, B: Backend>(
    items: impl Iterator<Item = &'a Spectral>,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let mut shape = None;
    let mut values = Vec::new();
    let mut count = 0;
    for spec in items {
        match shape {
            None => shape = Some(spec.shape()),
            Some(s) if s != spec.shape() => {
                return Err(SeparationError::Shape(format!(
                    "cannot batch {:?} with {s:?}",
                    spec.shape()
                )))
            }
            _ => {}
        }
        values.extend_from_slice(spec.values());
        count += 1;
    }
    let [c, f, t] =
        shape.ok_or_else(|| SeparationError::Shape("cannot stack an empty batch".into()))?;
    Ok(Tensor::from_data(TensorData::new(values, [count, c, f, t]), device))
}

#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<TrackDataset>,
    batch_size: usize,
    num_workers: usize,
    prefetch: usize,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<TrackDataset>,
        batch_size: usize,
        num_workers: usize,
        prefetch: usize,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            num_workers: num_workers.max(1),
            prefetch: prefetch.max(1),
        }
    }

    /// `ceil(tracks / batch_size)`; the last batch of an epoch may be short.
    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start loading `epoch`, skipping its first `skip_batches` batches without
    /// reading them (used when resuming mid-epoch).
    pub fn epoch(&self, epoch: usize, skip_batches: usize) -> EpochBatches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        match self.dataset.epoch_seed(epoch) {
            Some(seed) => order.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => order.shuffle(&mut rand::thread_rng()),
        }
        let order: Vec<usize> = order
            .into_iter()
            .skip(skip_batches * self.batch_size)
            .collect();
        let remaining = order.len();

        let (job_tx, job_rx) = unbounded::<usize>();
        for index in order {
            // the receiver is alive, so this cannot fail
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        let (sample_tx, sample_rx) = bounded(self.prefetch * self.batch_size);
        let workers = (0..self.num_workers.min(remaining.max(1)))
            .filter_map(|id| {
                let jobs = job_rx.clone();
                let out = sample_tx.clone();
                let dataset = Arc::clone(&self.dataset);
                thread::Builder::new()
                    .name(format!("mvsep-loader-{id}"))
                    .spawn(move || {
                        for index in jobs.iter() {
                            let sample = dataset.sample(index, epoch);
                            let failed = sample.is_err();
                            if out.send(sample).is_err() || failed {
                                break;
                            }
                        }
                    })
                    .map_err(|e| error!("failed to spawn loader worker: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();
        debug!(epoch, samples = remaining, workers = workers.len(), "epoch loading started");

        EpochBatches {
            samples: Some(sample_rx),
            workers,
            remaining,
            batch_size: self.batch_size,
        }
    }
}

/// Batches of one epoch. Dropping it stops and joins the workers.
pub struct EpochBatches {
    samples: Option<Receiver<Result<Sample>>>,
    workers: Vec<thread::JoinHandle<()>>,
    remaining: usize,
    batch_size: usize,
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let receiver = self.samples.as_ref()?;
        let want = self.batch_size.min(self.remaining);
        let mut samples = Vec::with_capacity(want);

        while samples.len() < want {
            match receiver.recv() {
                Ok(Ok(sample)) => samples.push(sample),
                Ok(Err(e)) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
                Err(_) => {
                    self.remaining = 0;
                    return Some(Err(SeparationError::Worker(
                        "all loader workers exited before the epoch was complete".into(),
                    )));
                }
            }
        }

        self.remaining -= want;
        Some(Ok(Batch { samples }))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        // Closing the receiver makes any blocked `send` fail, so workers exit.
        self.samples.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
