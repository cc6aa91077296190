use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::Backend,
    tensor::activation,
    Tensor,
};

use super::{ParamVisitor, ParamVisitorMut};

/// Squeeze-and-excitation channel gate.
///
/// Global average pooling gives one scalar per channel, a bottleneck MLP
/// (`C → C/r → C`) turns it into a weight in (0, 1), and the input is rescaled
/// channel by channel.
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pub(crate) reduce: Linear<B>,
    pub(crate) expand: Linear<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub(crate) fn init(channels: usize, reduction: usize, device: &B::Device) -> Self {
        let bottleneck = (channels / reduction).max(1);
        Self {
            reduce: LinearConfig::new(channels, bottleneck).init(device),
            expand: LinearConfig::new(bottleneck, channels).init(device),
        }
    }

    /// Per-channel gate values, shape `[batch, channels]`.
    pub(crate) fn weights(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [b, c, _, _] = x.dims();
        let pooled = x.mean_dim(3).mean_dim(2).reshape([b, c]);
        let hidden = activation::relu(self.reduce.forward(pooled));
        activation::sigmoid(self.expand.forward(hidden))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, _, _] = x.dims();
        let gate = self.weights(x.clone()).reshape([b, c, 1, 1]);
        x * gate
    }

    pub(crate) fn visit(&self, prefix: &str, visitor: &mut impl ParamVisitor<B>) {
        super::visit_linear(&self.reduce, &format!("{prefix}.reduce"), visitor);
        super::visit_linear(&self.expand, &format!("{prefix}.expand"), visitor);
    }

    pub(crate) fn visit_mut(&mut self, prefix: &str, visitor: &mut impl ParamVisitorMut<B>) {
        super::visit_linear_mut(&mut self.reduce, &format!("{prefix}.reduce"), visitor);
        super::visit_linear_mut(&mut self.expand, &format!("{prefix}.expand"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    #[test]
    fn gate_is_bounded_and_shape_preserving() {
        let device = Default::default();
        let se = SqueezeExcitation::<B>::init(8, 4, &device);
        let x = Tensor::<B, 4>::random([2, 8, 5, 6], Distribution::Normal(0.0, 3.0), &device);

        let w: Vec<f32> = se.weights(x.clone()).into_data().to_vec().unwrap();
        assert_eq!(w.len(), 16);
        assert!(w.iter().all(|&g| g > 0.0 && g < 1.0));

        assert_eq!(se.forward(x).dims(), [2, 8, 5, 6]);
    }

    #[test]
    fn rescales_each_channel_uniformly() {
        let device = Default::default();
        let se = SqueezeExcitation::<B>::init(4, 2, &device);
        let x = Tensor::<B, 4>::ones([1, 4, 3, 3], &device);

        let y: Vec<f32> = se.forward(x.clone()).into_data().to_vec().unwrap();
        let gate: Vec<f32> = se.weights(x).into_data().to_vec().unwrap();
        for (c, plane) in y.chunks(9).enumerate() {
            assert!(plane.iter().all(|&v| (v - gate[c]).abs() < 1e-6));
        }
    }
}
