use burn::{
    module::Param,
    prelude::Backend,
    tensor::{backend::AutodiffBackend, ElementConversion},
    Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ParamVisitor, SeparationModel};

/// Dynamic loss scaling.
///
/// The loss is multiplied by `scale` before back-propagation and every
/// gradient is divided by it afterwards. An overflow (any non-finite
/// gradient) skips the update and halves the scale; after `growth_interval`
/// clean steps in a row the scale doubles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn new(initial_scale: f32, growth_interval: usize) -> Self {
        Self {
            scale: initial_scale,
            growth_interval,
            ..Self::default()
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss.mul_scalar(self.scale)
    }

    /// Divide every parameter gradient by the current scale, in place.
    ///
    /// Returns `false` if any gradient is NaN or infinite. The check stays on
    /// the device and is read back once per call.
    pub fn unscale<B: AutodiffBackend>(
        &self,
        model: &SeparationModel<B>,
        grads: &mut B::Gradients,
    ) -> bool {
        let mut unscaler = Unscaler::<B> {
            grads,
            factor: 1.0 / self.scale,
            non_finite: None,
        };
        model.visit(&mut unscaler);
        unscaler.non_finite.map_or(true, |count| {
            let count: f32 = count.into_scalar().elem();
            count == 0.0
        })
    }

    /// Adjust the scale after a step whose gradients were (non-)finite.
    pub fn update(&mut self, finite: bool) {
        if finite {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
                debug!(scale = self.scale, "loss scale increased");
            }
        } else {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            debug!(scale = self.scale, "loss scale reduced after overflow");
        }
    }
}

struct Unscaler<'a, B: AutodiffBackend> {
    grads: &'a mut B::Gradients,
    factor: f32,
    /// Running count of non-finite gradient entries.
    non_finite: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ParamVisitor<B> for Unscaler<'_, B> {
    fn visit_param<const D: usize>(&mut self, _name: &str, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        if let Some(grad) = tensor.grad(&*self.grads) {
            let grad = grad.mul_scalar(self.factor);
            let bad = grad.clone().is_finite().bool_not().float().sum();
            self.non_finite = Some(match self.non_finite.take() {
                Some(count) => count + bad,
                None => bad,
            });
            tensor.grad_replace(&mut *self.grads, grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type B = Autodiff<NdArray<f32>>;

    #[test]
    fn grows_after_interval_and_backs_off_on_overflow() {
        let mut s = LossScaler::new(8.0, 3);
        s.update(true);
        s.update(true);
        assert_eq!(s.scale(), 8.0);
        s.update(true);
        assert_eq!(s.scale(), 16.0);

        s.update(true);
        s.update(false);
        assert_eq!(s.scale(), 8.0);
        // the clean-step counter restarts after an overflow
        s.update(true);
        s.update(true);
        assert_eq!(s.scale(), 8.0);
    }

    #[test]
    fn unscaled_gradients_match_unscaled_loss() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_hidden_size(4)
            .with_num_layers(3)
            .with_reduction_ratio(2)
            .init::<B>(&device);
        let x = Tensor::<B, 4>::random([1, 2, 5, 4], Distribution::Default, &device);
        let loss = || model.forward(x.clone()).unwrap().magnitude.sum();

        let plain = loss().backward();
        let expected = model.magnitude_head.weight.val().grad(&plain).unwrap();

        let scaler = LossScaler::new(1024.0, 10);
        let mut scaled = scaler.scale_loss(loss()).backward();
        assert!(scaler.unscale(&model, &mut scaled));
        let actual = model.magnitude_head.weight.val().grad(&scaled).unwrap();

        let diff: f32 = (actual - expected).abs().max().into_scalar();
        assert!(diff < 1e-4, "gradients differ by {diff}");
    }

    #[test]
    fn overflow_is_detected() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_hidden_size(4)
            .with_num_layers(2)
            .with_reduction_ratio(2)
            .init::<B>(&device);
        let x = Tensor::<B, 4>::ones([1, 2, 3, 3], &device);
        let loss = model.forward(x).unwrap().phase.sum().mul_scalar(f32::INFINITY);

        let scaler = LossScaler::default();
        let mut grads = scaler.scale_loss(loss).backward();
        assert!(!scaler.unscale(&model, &mut grads));
    }

    #[test]
    fn one_bad_entry_marks_the_whole_step() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_hidden_size(4)
            .with_num_layers(3)
            .with_reduction_ratio(2)
            .init::<B>(&device);
        let x = Tensor::<B, 4>::ones([1, 2, 3, 3], &device);
        let mut grads = model.forward(x).unwrap().magnitude.sum().backward();

        let scaler = LossScaler::new(2.0, 10);
        let weight = model.magnitude_head.weight.val();
        let mut grad = weight.grad(&grads).unwrap();
        let dims = grad.dims();
        let poisoned = Tensor::<<B as AutodiffBackend>::InnerBackend, 1>::from_floats(
            [f32::NAN],
            &device,
        )
        .reshape([1, 1, 1, 1]);
        grad = grad.slice_assign([0..1, 0..1, 0..1, 0..1], poisoned);
        assert_eq!(grad.dims(), dims);
        weight.grad_replace(&mut grads, grad);

        assert!(!scaler.unscale(&model, &mut grads));
    }
}
