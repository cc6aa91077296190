use std::{
    f32::consts::PI,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    module::Module,
    nn::loss::{MseLoss, Reduction},
    optim::{GradientsParams, Optimizer},
    prelude::Backend,
    lr_scheduler::{cosine::CosineAnnealingLrScheduler, LrScheduler},
    optim::LearningRate,
    tensor::{backend::AutodiffBackend, ElementConversion},
    Tensor,
};
use tracing::{info, warn};

use super::{scaler::LossScaler, scheduler::cosine_schedule};
use crate::{
    checkpoint::{decode_record, encode_record, write_loss_log, Checkpoint, LoadMode, TrainingState},
    config::{ModelConfig, TrainingConfig},
    data::{Batch, BatchLoader, TrackDataset},
    listener::{PipelineEvent, PipelineListener},
    model::{ModelOutput, SeparationModel},
    Result,
};

/// `MSE(magnitude) + MSE(phase)` against a normalized target.
///
/// The normalized target is real, so its magnitude is `|t|` and its phase is
/// `π` where `t < 0` and `0` elsewhere.
pub fn separation_loss<B: Backend>(output: ModelOutput<B>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let target_magnitude = target.clone().abs();
    let target_phase = target.lower_elem(0.0).float().mul_scalar(PI);

    let mse = MseLoss::new();
    mse.forward(output.magnitude, target_magnitude, Reduction::Mean)
        + mse.forward(output.phase, target_phase, Reduction::Mean)
}

/// Drives optimisation of a [`SeparationModel`] over a [`TrackDataset`].
pub struct Trainer<B: AutodiffBackend, O: Optimizer<SeparationModel<B>, B>> {
    model: SeparationModel<B>,
    optimizer: O,
    model_config: ModelConfig,
    config: TrainingConfig,
    loader: BatchLoader,
    scheduler: CosineAnnealingLrScheduler,
    total_steps: usize,
    state: TrainingState,
    resumed: bool,
    device: B::Device,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SeparationModel<B>, B>,
{
    /// Build the model and, if `config.resume_from` is set, restore model,
    /// optimizer, counters and loss scale from that checkpoint.
    ///
    /// The schedule always spans `epochs * batches_per_epoch` steps; a resumed
    /// run continues it from the restored step.
    pub fn new(
        model_config: &ModelConfig,
        config: &TrainingConfig,
        dataset: TrackDataset,
        optimizer: O,
        device: B::Device,
    ) -> Result<Self> {
        model_config.validate()?;
        config.validate()?;

        let loader = BatchLoader::new(
            Arc::new(dataset),
            config.batch_size,
            config.num_workers,
            config.prefetch,
        );
        let total_steps = config.epochs * loader.batches_per_epoch();

        let mut model = model_config.init::<B>(&device);
        let mut optimizer = optimizer;
        let mut state = TrainingState::default();
        let resumed = config.resume_from.is_some();

        if let Some(path) = &config.resume_from {
            let checkpoint = Checkpoint::load(path)?;
            if &checkpoint.model_config != model_config {
                warn!(
                    saved = ?checkpoint.model_config,
                    "checkpoint was written with a different model configuration"
                );
            }
            model = checkpoint.apply(model, LoadMode::Strict)?.0;
            match checkpoint.optimizer_state() {
                Some(bytes) => {
                    optimizer = optimizer.load_record(decode_record::<B, O::Record>(bytes, &device)?);
                }
                None => warn!("checkpoint has no optimizer state, starting from a fresh optimizer"),
            }
            state = checkpoint.state.clone();
        }
        let scheduler = cosine_schedule::<B>(config.learning_rate, total_steps, state.step)?;

        info!(
            params = model.num_params(),
            total_steps,
            start_step = state.step,
            "trainer ready"
        );

        Ok(Self {
            model,
            optimizer,
            model_config: model_config.clone(),
            config: config.clone(),
            loader,
            scheduler,
            total_steps,
            state,
            resumed,
            device,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn model(&self) -> &SeparationModel<B> {
        &self.model
    }

    /// Train until the schedule is exhausted. Returns the trained model and
    /// the final counters; the loss log is written to `loss_log_path`.
    pub fn fit(
        self,
        listener: &mut impl PipelineListener,
    ) -> Result<(SeparationModel<B>, TrainingState)> {
        let Self {
            mut model,
            mut optimizer,
            model_config,
            config,
            loader,
            mut scheduler,
            total_steps,
            mut state,
            resumed,
            device,
        } = self;

        let batches_per_epoch = loader.batches_per_epoch();
        listener.on_event(PipelineEvent::TrainingStarted {
            start_step: state.step,
            total_steps,
            batches_per_epoch,
        });
        if resumed {
            listener.on_event(PipelineEvent::Resumed {
                step: state.step,
                avg_loss: state.avg_loss,
            });
        }

        let start_epoch = state.step / batches_per_epoch;
        let skip = state.step % batches_per_epoch;

        for epoch in start_epoch..config.epochs {
            listener.on_event(PipelineEvent::EpochStarted {
                epoch,
                epochs: config.epochs,
            });
            let skip_batches = if epoch == start_epoch { skip } else { 0 };

            for batch in loader.epoch(epoch, skip_batches) {
                let batch = batch?;
                let lr = scheduler.step();
                let (next, loss, applied) =
                    training_step(model, &mut optimizer, &mut state.scaler, &batch, lr, &device)?;
                model = next;

                state.avg_loss =
                    (state.avg_loss * state.step as f64 + loss as f64) / (state.step + 1) as f64;
                state.loss_log.push(loss);
                state.step += 1;

                listener.on_event(PipelineEvent::StepDone {
                    step: state.step,
                    total_steps,
                    epoch,
                    loss,
                    avg_loss: state.avg_loss,
                    lr,
                    skipped: !applied,
                });

                if state.step % config.checkpoint_steps == 0 {
                    let path = save_checkpoint(
                        &model,
                        &optimizer,
                        &model_config,
                        &state,
                        &config.checkpoint_dir,
                    )?;
                    listener.on_event(PipelineEvent::CheckpointSaved {
                        step: state.step,
                        path,
                    });
                }
            }
        }

        write_loss_log(&config.loss_log_path, &state.loss_log)?;
        listener.on_event(PipelineEvent::TrainingDone {
            steps: state.step,
            avg_loss: state.avg_loss,
        });
        Ok((model, state))
    }
}

/// Forward, scaled backward, unscale, and (unless gradients overflowed) one
/// optimizer update. Returns the updated model, the unscaled loss and whether
/// the update was applied.
fn training_step<B, O>(
    model: SeparationModel<B>,
    optimizer: &mut O,
    scaler: &mut LossScaler,
    batch: &Batch,
    lr: LearningRate,
    device: &B::Device,
) -> Result<(SeparationModel<B>, f32, bool)>
where
    B: AutodiffBackend,
    O: Optimizer<SeparationModel<B>, B>,
{
    let mixture = batch.mixture::<B>(device)?;
    let target = batch.target::<B>(device)?;

    let loss = separation_loss(model.forward(mixture)?, target);
    let value: f32 = loss.clone().into_scalar().elem();

    let mut grads = scaler.scale_loss(loss).backward();
    let finite = scaler.unscale(&model, &mut grads);
    scaler.update(finite);
    if !finite {
        warn!(loss = value, scale = scaler.scale(), "non-finite gradients, update skipped");
        return Ok((model, value, false));
    }

    let grads = GradientsParams::from_grads(grads, &model);
    Ok((optimizer.step(lr, model, grads), value, true))
}

fn save_checkpoint<B, O>(
    model: &SeparationModel<B>,
    optimizer: &O,
    model_config: &ModelConfig,
    state: &TrainingState,
    dir: &Path,
) -> Result<PathBuf>
where
    B: AutodiffBackend,
    O: Optimizer<SeparationModel<B>, B>,
{
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("checkpoint_step_{}.safetensors", state.step));
    let optimizer_state = encode_record::<B, _>(optimizer.to_record())?;
    Checkpoint::capture(model, model_config, state.clone(), Some(optimizer_state))?.save(&path)?;
    Ok(path)
}
