use burn::{
    module::Module,
    nn::conv::Conv2d,
    prelude::Backend,
    Tensor,
};
use tracing::debug;

use super::{
    block::{conv3x3, InputProjection, ResidualBlock},
    ParamVisitor, ParamVisitorMut,
};
use crate::{config::ModelConfig, dsp::Spectral, Result, SeparationError};

/// Predicted magnitude and phase, both `[batch, channels, bins, frames]`.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    pub magnitude: Tensor<B, 4>,
    pub phase: Tensor<B, 4>,
}

/// Fully convolutional separator over normalized magnitude spectrograms.
///
/// ```text
/// input ─ conv3x3 ─ BN ─ ReLU ─┬─ block(d=1) ─ block(d=r) ─ … ─ block(d=r^(n-3)) ─┬─ magnitude_head
///                              │                                                   └─ phase_head
/// ```
/// Each block is a dilated residual block with a squeeze-and-excitation gate.
#[derive(Module, Debug)]
pub struct SeparationModel<B: Backend> {
    pub(crate) input: InputProjection<B>,
    pub(crate) blocks: Vec<ResidualBlock<B>>,
    pub(crate) magnitude_head: Conv2d<B>,
    pub(crate) phase_head: Conv2d<B>,

    in_channels: usize,
}

impl ModelConfig {
    /// Build a freshly initialised model. Call [`ModelConfig::validate`] first.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SeparationModel<B> {
        let blocks = (0..self.num_blocks())
            .map(|i| {
                ResidualBlock::init(
                    self.hidden_size,
                    self.dilation(i),
                    self.reduction_ratio,
                    device,
                )
            })
            .collect();

        SeparationModel {
            input: InputProjection::init(self.in_channels, self.hidden_size, device),
            blocks,
            magnitude_head: conv3x3(self.hidden_size, self.in_channels, 1, device),
            phase_head: conv3x3(self.hidden_size, self.in_channels, 1, device),
            in_channels: self.in_channels,
        }
    }
}

impl<B: Backend> SeparationModel<B> {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Run the network on `[batch, in_channels, bins, frames]`.
    ///
    /// A channel count other than `in_channels` is a configuration error.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<ModelOutput<B>> {
        let dims = x.dims();
        if dims[1] != self.in_channels {
            return Err(SeparationError::Config(format!(
                "model expects {} input channels, got input of shape {dims:?}",
                self.in_channels
            )));
        }

        let mut h = self.input.forward(x);
        for block in &self.blocks {
            h = block.forward(h);
        }

        Ok(ModelOutput {
            magnitude: self.magnitude_head.forward(h.clone()),
            phase: self.phase_head.forward(h),
        })
    }

    /// Walk every parameter and running statistic with its checkpoint name.
    pub fn visit(&self, visitor: &mut impl ParamVisitor<B>) {
        self.input.visit("input", visitor);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&format!("blocks.{i}"), visitor);
        }
        super::visit_conv2d(&self.magnitude_head, "magnitude_head", visitor);
        super::visit_conv2d(&self.phase_head, "phase_head", visitor);
    }

    pub fn visit_mut(&mut self, visitor: &mut impl ParamVisitorMut<B>) {
        self.input.visit_mut("input", visitor);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_mut(&format!("blocks.{i}"), visitor);
        }
        super::visit_conv2d_mut(&mut self.magnitude_head, "magnitude_head", visitor);
        super::visit_conv2d_mut(&mut self.phase_head, "phase_head", visitor);
    }
}

/// Anything that predicts the removable source for one normalized chunk.
///
/// The inference pipeline only needs this, which lets tests drive it with a
/// fixed estimator instead of a network.
pub trait SourceEstimator {
    /// Map a normalized `[channels, bins, frames]` magnitude to the predicted
    /// `(magnitude, phase)` of the source to remove, in the same shape.
    fn estimate(&self, normalized: &Spectral) -> Result<(Spectral, Spectral)>;
}

impl<B: Backend> SourceEstimator for SeparationModel<B> {
    fn estimate(&self, normalized: &Spectral) -> Result<(Spectral, Spectral)> {
        let device = self.devices().into_iter().next().unwrap_or_default();
        let [c, f, t] = normalized.shape();

        let x = normalized.to_tensor::<B>(&device).reshape([1, c, f, t]);
        let out = self.forward(x)?;
        debug!(shape = ?[c, f, t], "model forward");

        let magnitude = Spectral::from_tensor(out.magnitude.reshape([c, f, t]))?;
        let phase = Spectral::from_tensor(out.phase.reshape([c, f, t]))?;
        Ok((magnitude, phase))
    }
}
