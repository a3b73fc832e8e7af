//! Branch transform descriptors
//!
//! A [`BranchSpec`] describes one candidate transform. A switching layer
//! instantiates the same descriptor once per branch, so each branch starts from
//! independent weights but shares its shape.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use burn_switched_core::blocks::{ConvLelu, ConvOptions, MultiConvBlock};

use crate::error::{Result, SwitchError};

/// Kernel sizes for a multi-layer transform: one size for every layer or
/// one per layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KernelSizes {
    Uniform(usize),
    PerLayer(Vec<usize>),
}

impl KernelSizes {
    /// Expands to exactly `depth` kernel sizes
    pub fn expand(&self, depth: usize) -> Result<Vec<usize>> {
        let sizes = match self {
            KernelSizes::Uniform(k) => vec![*k; depth],
            KernelSizes::PerLayer(ks) if ks.len() == depth => ks.clone(),
            KernelSizes::PerLayer(ks) => {
                return Err(SwitchError::InvalidConfig(format!(
                    "{} kernel sizes given for {depth} layers",
                    ks.len()
                )))
            }
        };
        if let Some(k) = sizes.iter().find(|k| **k % 2 == 0) {
            return Err(SwitchError::InvalidConfig(format!(
                "kernel size {k} must be odd to preserve spatial size"
            )));
        }
        Ok(sizes)
    }
}

impl From<usize> for KernelSizes {
    fn from(k: usize) -> Self {
        KernelSizes::Uniform(k)
    }
}

/// Shape of one branch transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchSpec {
    /// Stack of leaky-ReLU convs with a learned output scale
    MultiConv {
        filters_in: usize,
        filters_mid: usize,
        filters_out: usize,
        kernel_sizes: Vec<usize>,
        #[serde(default)]
        norm: bool,
        #[serde(default = "default_weight_init")]
        weight_init_factor: f64,
    },
    /// A single leaky-ReLU conv
    Conv {
        filters_in: usize,
        filters_out: usize,
        kernel_size: usize,
        #[serde(default = "default_weight_init")]
        weight_init_factor: f64,
    },
}

fn default_weight_init() -> f64 {
    1.0
}

impl BranchSpec {
    /// The generator's branch: widen by 1.5x, `depth` layers, quiet init
    pub fn multi_conv(filters: usize, kernel_sizes: &KernelSizes, depth: usize) -> Result<Self> {
        Ok(BranchSpec::MultiConv {
            filters_in: filters,
            filters_mid: filters * 3 / 2,
            filters_out: filters,
            kernel_sizes: kernel_sizes.expand(depth)?,
            norm: false,
            weight_init_factor: 0.1,
        })
    }

    pub fn filters_in(&self) -> usize {
        match self {
            BranchSpec::MultiConv { filters_in, .. } | BranchSpec::Conv { filters_in, .. } => *filters_in,
        }
    }

    pub fn filters_out(&self) -> usize {
        match self {
            BranchSpec::MultiConv { filters_out, .. } | BranchSpec::Conv { filters_out, .. } => *filters_out,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BranchSpec::MultiConv { kernel_sizes, .. } => {
                if kernel_sizes.len() < 2 {
                    return Err(SwitchError::InvalidConfig(
                        "multi-conv branches need at least two layers".into(),
                    ));
                }
                KernelSizes::PerLayer(kernel_sizes.clone()).expand(kernel_sizes.len())?;
            }
            BranchSpec::Conv { kernel_size, .. } => {
                KernelSizes::Uniform(*kernel_size).expand(1)?;
            }
        }
        Ok(())
    }

    /// Builds one branch with fresh weights
    pub fn instantiate<B: Backend>(&self, device: &B::Device) -> BranchTransform<B> {
        match self {
            BranchSpec::MultiConv {
                filters_in,
                filters_mid,
                filters_out,
                kernel_sizes,
                norm,
                weight_init_factor,
            } => BranchTransform::MultiConv(MultiConvBlock::new(
                *filters_in,
                *filters_mid,
                *filters_out,
                kernel_sizes,
                *norm,
                *weight_init_factor,
                device,
            )),
            BranchSpec::Conv {
                filters_in,
                filters_out,
                kernel_size,
                weight_init_factor,
            } => BranchTransform::Conv(ConvLelu::new(
                *filters_in,
                *filters_out,
                ConvOptions::default()
                    .kernel(*kernel_size)
                    .norm(false)
                    .bias(false)
                    .weight_init(*weight_init_factor),
                device,
            )),
        }
    }
}

/// One instantiated branch
#[derive(Module, Debug)]
pub enum BranchTransform<B: Backend> {
    MultiConv(MultiConvBlock<B>),
    Conv(ConvLelu<B>),
}

impl<B: Backend> BranchTransform<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            BranchTransform::MultiConv(block) => block.forward(x),
            BranchTransform::Conv(conv) => conv.forward(x),
        }
    }
}
