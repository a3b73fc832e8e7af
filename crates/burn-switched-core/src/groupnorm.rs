//! Group normalization
//!
//! Per-sample statistics over channel groups, so a layer behaves the same
//! for one image as for a batch. Every normalized layer in the switching
//! stack uses it.

use burn::module::Param;
use burn::prelude::*;

/// `(x - mean_g) / sqrt(var_g + eps) * weight + bias` over `num_groups`
/// channel groups `g`
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    pub num_groups: usize,
    /// Per-channel scale, starts at 1
    pub weight: Param<Tensor<B, 1>>,
    /// Per-channel shift, starts at 0
    pub bias: Param<Tensor<B, 1>>,
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// `num_channels` must be divisible by `num_groups`
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Self {
        debug_assert!(
            num_groups > 0 && num_channels % num_groups == 0,
            "{num_channels} channels cannot be split into {num_groups} groups"
        );
        Self {
            num_groups,
            weight: Param::from_tensor(Tensor::ones([num_channels], device)),
            bias: Param::from_tensor(Tensor::zeros([num_channels], device)),
            eps: 1e-5,
        }
    }

    /// Normalizes a `[batch, channels, height, width]` tensor
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        let x = x.reshape([batch, self.num_groups, group_size * height * width]);

        let mean = x.clone().mean_dim(2);
        let diff = x - mean;
        let var = (diff.clone() * diff.clone()).mean_dim(2);
        let x = diff / (var + self.eps).sqrt();

        let x = x.reshape([batch, channels, height, width]);

        let weight = self.weight.val().reshape([1, channels, 1, 1]);
        let bias = self.bias.val().reshape([1, channels, 1, 1]);

        x * weight + bias
    }
}
