use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::Backend,
    tensor::activation,
    Tensor,
};

use super::{attention::SqueezeExcitation, ParamVisitor, ParamVisitorMut};

/// 3×3 convolution → batch norm → ReLU, projecting input channels to the hidden width.
#[derive(Module, Debug)]
pub struct InputProjection<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) norm: BatchNorm<B>,
}

impl<B: Backend> InputProjection<B> {
    pub(crate) fn init(chin: usize, chout: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(chin, chout, 1, device),
            norm: BatchNormConfig::new(chout).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        activation::relu(self.norm.forward(self.conv.forward(x)))
    }

    pub(crate) fn visit(&self, prefix: &str, visitor: &mut impl ParamVisitor<B>) {
        super::visit_conv2d(&self.conv, &format!("{prefix}.conv"), visitor);
        super::visit_batch_norm(&self.norm, &format!("{prefix}.norm"), visitor);
    }

    pub(crate) fn visit_mut(&mut self, prefix: &str, visitor: &mut impl ParamVisitorMut<B>) {
        super::visit_conv2d_mut(&mut self.conv, &format!("{prefix}.conv"), visitor);
        super::visit_batch_norm_mut(&mut self.norm, &format!("{prefix}.norm"), visitor);
    }
}

/// Dilated residual block: `x + SE(ReLU(BN(conv_d(x))))`.
///
/// Padding equals the dilation so the time-frequency plane keeps its size.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) norm: BatchNorm<B>,
    pub(crate) attention: SqueezeExcitation<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub(crate) fn init(
        channels: usize,
        dilation: usize,
        reduction: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: conv3x3(channels, channels, dilation, device),
            norm: BatchNormConfig::new(channels).init(device),
            attention: SqueezeExcitation::init(channels, reduction, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = x.clone();
        let x = self.conv.forward(x);
        let x = activation::relu(self.norm.forward(x));
        self.attention.forward(x) + residual
    }

    pub(crate) fn visit(&self, prefix: &str, visitor: &mut impl ParamVisitor<B>) {
        super::visit_conv2d(&self.conv, &format!("{prefix}.conv"), visitor);
        super::visit_batch_norm(&self.norm, &format!("{prefix}.norm"), visitor);
        self.attention.visit(&format!("{prefix}.attention"), visitor);
    }

    pub(crate) fn visit_mut(&mut self, prefix: &str, visitor: &mut impl ParamVisitorMut<B>) {
        super::visit_conv2d_mut(&mut self.conv, &format!("{prefix}.conv"), visitor);
        super::visit_batch_norm_mut(&mut self.norm, &format!("{prefix}.norm"), visitor);
        self.attention
            .visit_mut(&format!("{prefix}.attention"), visitor);
    }
}

pub(crate) fn conv3x3<B: Backend>(
    chin: usize,
    chout: usize,
    dilation: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([chin, chout], [3, 3])
        .with_dilation([dilation, dilation])
        .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
        .init(device)
}
