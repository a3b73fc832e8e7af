//! Switch computer: one complete switching layer
//!
//! Runs `T` branch transforms on a shared pre-transformed input, asks a
//! multiplexer for routing logits, blends the branches through a
//! [`SwitchCore`] and adds the result back onto the identity path.

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};

use burn_switched_core::blocks::{ConvLelu, ConvOptions};
use burn_switched_core::Recompute;

use crate::attention_norm::{AttentionNorm, NormReducer};
use crate::branch::{BranchSpec, BranchTransform};
use crate::error::{Result, SwitchError};
use crate::multiplexer::{Multiplexer, MultiplexerConfig, MultiplexerInput};
use crate::switch::{SwitchCore, SwitchOutput};

/// Whether a pass trains or evaluates
///
/// Evaluation passes add no noise, never touch attention accumulators and
/// require the temperature to be exactly 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassMode {
    #[default]
    Train,
    Eval,
}

impl PassMode {
    pub fn is_train(self) -> bool {
        matches!(self, PassMode::Train)
    }
}

/// Per-call arguments of [`SwitchComputer::forward`]
#[derive(Debug, Clone)]
pub struct SwitchForward<B: Backend> {
    /// Multiplexer input, defaults to the un-noised layer input
    pub attention_input: Option<Tensor<B, 4>>,
    /// Conditioning embedding for embedding multiplexers
    pub embedding: Option<Tensor<B, 4>>,
    /// Residual base, defaults to the layer input
    pub identity: Option<Tensor<B, 4>>,
    pub mode: PassMode,
    /// Extra multiplier on both residual contributions
    pub scale: f64,
    pub recompute: Recompute,
}

impl<B: Backend> Default for SwitchForward<B> {
    fn default() -> Self {
        Self {
            attention_input: None,
            embedding: None,
            identity: None,
            mode: PassMode::Train,
            scale: 1.0,
            recompute: Recompute::Retain,
        }
    }
}

impl<B: Backend> SwitchForward<B> {
    pub fn mode(mut self, mode: PassMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn recompute(mut self, recompute: Recompute) -> Self {
        self.recompute = recompute;
        self
    }
}

/// Result of one switching layer
#[derive(Debug, Clone)]
pub struct SwitchComputerOutput<B: Backend> {
    pub output: Tensor<B, 4>,
    /// [batch, T, height, width]
    pub attention: Tensor<B, 4>,
    pub logits: Tensor<B, 4>,
}

/// Configuration of one switching layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchComputerConfig {
    /// Shape of every branch
    pub branch: BranchSpec,
    pub branch_count: usize,
    pub multiplexer: MultiplexerConfig,
    /// Shared conv applied before the branches
    #[serde(default = "default_true")]
    pub pre_transform: bool,
    #[serde(default = "default_initial_temperature")]
    pub initial_temperature: f64,
    #[serde(default = "default_true")]
    pub attention_norm: bool,
    /// Accumulator rows per branch
    #[serde(default = "default_anorm_multiplier")]
    pub anorm_multiplier: usize,
    #[serde(default)]
    pub add_noise: bool,
    #[serde(default = "default_true")]
    pub post_switch_conv: bool,
}

fn default_true() -> bool {
    true
}

fn default_initial_temperature() -> f64 {
    20.0
}

fn default_anorm_multiplier() -> usize {
    16
}

impl SwitchComputerConfig {
    pub fn new(branch: BranchSpec, branch_count: usize, multiplexer: MultiplexerConfig) -> Self {
        Self {
            branch,
            branch_count,
            multiplexer,
            pre_transform: true,
            initial_temperature: default_initial_temperature(),
            attention_norm: true,
            anorm_multiplier: default_anorm_multiplier(),
            add_noise: false,
            post_switch_conv: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.branch.validate()?;

        let multiplexer = self.multiplexer.branch_count();
        if multiplexer != self.branch_count || self.branch_count == 0 {
            return Err(SwitchError::BranchCountMismatch {
                transforms: self.branch_count,
                multiplexer,
            });
        }

        if self.branch.filters_in() != self.branch.filters_out() {
            return Err(SwitchError::InvalidConfig(format!(
                "branches map {} to {} channels but must preserve width for the residual",
                self.branch.filters_in(),
                self.branch.filters_out()
            )));
        }

        let expected = match &self.multiplexer {
            MultiplexerConfig::Plain {
                input_channels,
                feed_transforms: true,
                ..
            } => Some(*input_channels),
            MultiplexerConfig::QueryKey { filters, .. } => Some(*filters),
            _ => None,
        };
        if let Some(expected) = expected {
            if expected != self.branch.filters_out() {
                return Err(SwitchError::InvalidConfig(format!(
                    "multiplexer reads {expected}-channel branches but branches produce {}",
                    self.branch.filters_out()
                )));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SwitchComputer<B>> {
        self.validate()?;

        let multiplexer = self.multiplexer.init(device)?;
        if multiplexer.branch_count() != self.branch_count {
            return Err(SwitchError::BranchCountMismatch {
                transforms: self.branch_count,
                multiplexer: multiplexer.branch_count(),
            });
        }

        let filters = self.branch.filters_in();
        let norm = self
            .attention_norm
            .then(|| AttentionNorm::new(self.branch_count, self.anorm_multiplier * self.branch_count, device));

        Ok(SwitchComputer {
            multiplexer,
            pre_transform: self.pre_transform.then(|| {
                ConvLelu::new(
                    filters,
                    filters,
                    ConvOptions::default().norm(false).bias(false).weight_init(0.1),
                    device,
                )
            }),
            transforms: (0..self.branch_count)
                .map(|_| self.branch.instantiate(device))
                .collect(),
            switch: SwitchCore::new(self.initial_temperature, norm)?,
            noise_scale: Param::from_tensor(Tensor::full([1], 1e-3, device)),
            switch_scale: Param::from_tensor(Tensor::ones([1], device)),
            post_switch_conv: self
                .post_switch_conv
                .then(|| ConvLelu::plain(filters, filters, device)),
            post_switch_scale: Param::from_tensor(Tensor::full([1], 0.1, device)),
            add_noise: self.add_noise,
            update_norm: true,
        })
    }
}

/// One switching layer
#[derive(Module, Debug)]
pub struct SwitchComputer<B: Backend> {
    pub multiplexer: Multiplexer<B>,
    pub pre_transform: Option<ConvLelu<B>>,
    pub transforms: Vec<BranchTransform<B>>,
    pub switch: SwitchCore<B>,
    /// Magnitude of the training noise added to the branch input
    pub noise_scale: Param<Tensor<B, 1>>,
    pub switch_scale: Param<Tensor<B, 1>>,
    pub post_switch_conv: Option<ConvLelu<B>>,
    pub post_switch_scale: Param<Tensor<B, 1>>,
    pub add_noise: bool,
    /// Record training passes in the attention normalizer
    pub update_norm: bool,
}

impl<B: Backend> SwitchComputer<B> {
    pub fn branch_count(&self) -> usize {
        self.transforms.len()
    }

    pub fn temperature(&self) -> f64 {
        self.switch.temperature()
    }

    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        self.switch.set_temperature(temperature)
    }

    pub fn attention_norm(&self) -> Option<&AttentionNorm<B>> {
        self.switch.attention_norm.as_ref()
    }

    pub fn reduce_norm(&mut self, reducer: &dyn NormReducer<B>) {
        self.switch.reduce_norm(reducer);
    }

    /// Runs the layer on `x` `[batch, filters, height, width]`
    pub fn forward(&mut self, x: Tensor<B, 4>, args: SwitchForward<B>) -> Result<SwitchComputerOutput<B>> {
        if !args.mode.is_train() && self.temperature() != 1.0 {
            return Err(SwitchError::EvalTemperature(self.temperature()));
        }

        let identity = args.identity.unwrap_or_else(|| x.clone());
        let attention_input = args.attention_input.unwrap_or_else(|| x.clone());

        let mut x = x;
        if args.mode.is_train() && self.add_noise {
            let noise = Tensor::random(x.shape(), Distribution::Normal(0.0, 1.0), &x.device());
            x = x + noise * self.noise_scale.val().reshape([1, 1, 1, 1]);
        }
        if let Some(pre) = &self.pre_transform {
            x = pre.forward(x);
        }

        let branches: Tensor<B, 5> = args.recompute.run("branches", || {
            Tensor::stack(
                self.transforms.iter().map(|t| t.forward(x.clone())).collect(),
                1,
            )
        });

        let logits = args.recompute.run("multiplexer", || {
            self.multiplexer.produce_logits(MultiplexerInput {
                features: attention_input,
                embedding: args.embedding,
                branches: branches.clone(),
            })
        })?;

        let [b, t, _, h, w] = branches.dims();
        if logits.dims() != [b, t, h, w] {
            let [_, produced, _, _] = logits.dims();
            return Err(SwitchError::BranchCountMismatch {
                transforms: t,
                multiplexer: produced,
            });
        }

        let update = args.mode.is_train() && self.update_norm;
        let SwitchOutput {
            mixed,
            attention,
            logits,
        } = self.switch.combine(branches, logits, update);

        let mut output = identity + mixed * self.switch_scale.val().reshape([1, 1, 1, 1]) * args.scale;
        if let Some(post) = &self.post_switch_conv {
            let residual = post.forward(output.clone());
            output = output + residual * self.post_switch_scale.val().reshape([1, 1, 1, 1]) * args.scale;
        }

        Ok(SwitchComputerOutput {
            output,
            attention,
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::KernelSizes;
    use burn_ndarray::NdArray;
    use burn_switched_core::SkipFusion;

    type TestBackend = NdArray<f32>;

    fn config(branch_count: usize, multiplexer_branches: usize) -> SwitchComputerConfig {
        SwitchComputerConfig::new(
            BranchSpec::multi_conv(16, &KernelSizes::Uniform(3), 2).unwrap(),
            branch_count,
            MultiplexerConfig::Plain {
                input_channels: 16,
                base_filters: 16,
                reductions: 2,
                processing_depth: 1,
                branch_count: multiplexer_branches,
                fusion: SkipFusion::Concat,
                feed_transforms: false,
            },
        )
    }

    fn input(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 16, 8, 8], Distribution::Normal(0.0, 1.0), device)
    }

    #[test]
    fn test_preserves_shape() {
        let device = Default::default();
        let mut computer = config(4, 4).init::<TestBackend>(&device).unwrap();
        let out = computer.forward(input(&device), SwitchForward::default()).unwrap();

        assert_eq!(out.output.dims(), [2, 16, 8, 8]);
        assert_eq!(out.attention.dims(), [2, 4, 8, 8]);
        assert_eq!(out.logits.dims(), [2, 4, 8, 8]);
    }

    #[test]
    fn test_branch_count_mismatch_fails_at_construction() {
        let device = Default::default();
        let result = config(4, 3).init::<TestBackend>(&device);
        assert!(matches!(
            result,
            Err(SwitchError::BranchCountMismatch {
                transforms: 4,
                multiplexer: 3
            })
        ));
    }

    #[test]
    fn test_zero_residual_scales_return_identity() {
        let device = Default::default();
        let mut cfg = config(3, 3);
        cfg.add_noise = true;
        let mut computer = cfg.init::<TestBackend>(&device).unwrap();
        computer.switch_scale = Param::from_tensor(Tensor::zeros([1], &device));
        computer.post_switch_scale = Param::from_tensor(Tensor::zeros([1], &device));

        let x = input(&device);
        let out = computer.forward(x.clone(), SwitchForward::default()).unwrap();

        let expected: Vec<f32> = x.into_data().to_vec().unwrap();
        let actual: Vec<f32> = out.output.into_data().to_vec().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_explicit_identity_is_the_residual_base() {
        let device = Default::default();
        let mut computer = config(2, 2).init::<TestBackend>(&device).unwrap();
        computer.switch_scale = Param::from_tensor(Tensor::zeros([1], &device));
        computer.post_switch_conv = None;

        let identity = Tensor::<TestBackend, 4>::ones([2, 16, 8, 8], &device);
        let args = SwitchForward {
            identity: Some(identity),
            ..Default::default()
        };
        let out = computer.forward(input(&device), args).unwrap();
        let values: Vec<f32> = out.output.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_eval_requires_unit_temperature() {
        let device = Default::default();
        let mut computer = config(2, 2).init::<TestBackend>(&device).unwrap();
        assert_eq!(computer.temperature(), 20.0);

        let result = computer.forward(input(&device), SwitchForward::default().mode(PassMode::Eval));
        assert!(matches!(result, Err(SwitchError::EvalTemperature(t)) if t == 20.0));

        computer.set_temperature(1.0).unwrap();
        let out = computer
            .forward(input(&device), SwitchForward::default().mode(PassMode::Eval))
            .unwrap();
        assert_eq!(out.output.dims(), [2, 16, 8, 8]);
        assert_eq!(computer.attention_norm().unwrap().index, 0);
    }

    #[test]
    fn test_recompute_does_not_change_output() {
        let device = Default::default();
        let mut computer = config(3, 3).init::<TestBackend>(&device).unwrap();
        computer.update_norm = false;
        let x = input(&device);

        let retained = computer
            .forward(x.clone(), SwitchForward::default())
            .unwrap()
            .output;
        let checkpointed = computer
            .forward(x, SwitchForward::default().recompute(Recompute::Checkpoint))
            .unwrap()
            .output;

        let a: Vec<f32> = retained.into_data().to_vec().unwrap();
        let b: Vec<f32> = checkpointed.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_query_key_branch_width_must_match() {
        let device = Default::default();
        let cfg = SwitchComputerConfig::new(
            BranchSpec::multi_conv(16, &KernelSizes::Uniform(3), 2).unwrap(),
            2,
            MultiplexerConfig::QueryKey {
                filters: 8,
                branch_count: 2,
                reductions: 1,
                embedding_channels: None,
                pyramid: false,
            },
        );
        assert!(matches!(
            cfg.init::<TestBackend>(&device),
            Err(SwitchError::InvalidConfig(_))
        ));
    }
}
