//! The separation network and the named-parameter walk used by checkpoints
//! and gradient unscaling.
//!
//! Names follow the module tree (`blocks.3.attention.reduce.weight`) so that a
//! checkpoint can be merged into a model by name.

pub mod attention;
pub mod block;
pub mod separator;

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm, Linear},
    prelude::Backend,
    Tensor,
};

pub use separator::{ModelOutput, SeparationModel, SourceEstimator};

/// Read-only walk over every float tensor of a model.
pub trait ParamVisitor<B: Backend> {
    fn visit_param<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>);

    /// Batch-norm running statistics. They are not trained, so gradient
    /// walks can ignore them.
    fn visit_running(&mut self, _name: &str, _state: &RunningState<Tensor<B, 1>>) {}
}

/// Mutable walk, used to replace tensors in place.
pub trait ParamVisitorMut<B: Backend> {
    fn visit_param<const D: usize>(&mut self, name: &str, param: &mut Param<Tensor<B, D>>);

    fn visit_running(&mut self, name: &str, state: &mut RunningState<Tensor<B, 1>>);
}

// ─── Primitive layers ───────────────────────────────────────────────────────

fn visit_conv2d<B: Backend>(conv: &Conv2d<B>, prefix: &str, v: &mut impl ParamVisitor<B>) {
    v.visit_param(&format!("{prefix}.weight"), &conv.weight);
    if let Some(bias) = &conv.bias {
        v.visit_param(&format!("{prefix}.bias"), bias);
    }
}

fn visit_conv2d_mut<B: Backend>(
    conv: &mut Conv2d<B>,
    prefix: &str,
    v: &mut impl ParamVisitorMut<B>,
) {
    v.visit_param(&format!("{prefix}.weight"), &mut conv.weight);
    if let Some(bias) = &mut conv.bias {
        v.visit_param(&format!("{prefix}.bias"), bias);
    }
}

fn visit_linear<B: Backend>(linear: &Linear<B>, prefix: &str, v: &mut impl ParamVisitor<B>) {
    // burn stores Linear weights as [in, out]
    v.visit_param(&format!("{prefix}.weight"), &linear.weight);
    if let Some(bias) = &linear.bias {
        v.visit_param(&format!("{prefix}.bias"), bias);
    }
}

fn visit_linear_mut<B: Backend>(
    linear: &mut Linear<B>,
    prefix: &str,
    v: &mut impl ParamVisitorMut<B>,
) {
    v.visit_param(&format!("{prefix}.weight"), &mut linear.weight);
    if let Some(bias) = &mut linear.bias {
        v.visit_param(&format!("{prefix}.bias"), bias);
    }
}

fn visit_batch_norm<B: Backend>(bn: &BatchNorm<B>, prefix: &str, v: &mut impl ParamVisitor<B>) {
    v.visit_param(&format!("{prefix}.gamma"), &bn.gamma);
    v.visit_param(&format!("{prefix}.beta"), &bn.beta);
    v.visit_running(&format!("{prefix}.running_mean"), &bn.running_mean);
    v.visit_running(&format!("{prefix}.running_var"), &bn.running_var);
}

fn visit_batch_norm_mut<B: Backend>(
    bn: &mut BatchNorm<B>,
    prefix: &str,
    v: &mut impl ParamVisitorMut<B>,
) {
    v.visit_param(&format!("{prefix}.gamma"), &mut bn.gamma);
    v.visit_param(&format!("{prefix}.beta"), &mut bn.beta);
    v.visit_running(&format!("{prefix}.running_mean"), &mut bn.running_mean);
    v.visit_running(&format!("{prefix}.running_var"), &mut bn.running_var);
}
