//! Convolutional building blocks: conv/norm/activation units, halving and
//! expansion stages, nearest-neighbour upsampling

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    PaddingConfig2d,
};
use burn::module::Param;
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, silu};

use crate::groupnorm::GroupNorm;

/// Group count used by [`ConvGnSilu`] unless overridden
pub const DEFAULT_NUM_GROUPS: usize = 8;

/// Negative slope of the leaky ReLU used by [`ConvLelu`]
pub const LELU_SLOPE: f64 = 0.2;

fn conv2d<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    let pad = kernel_size / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_bias(bias)
        .init(device)
}

/// Scales freshly initialized conv weights, keeping residual branches quiet
/// at the start of training
fn scale_weights<B: Backend>(mut conv: Conv2d<B>, factor: f64) -> Conv2d<B> {
    if factor != 1.0 {
        conv.weight = conv.weight.map(|w| w * factor);
    }
    conv
}

/// Options shared by the conv units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvOptions {
    pub kernel_size: usize,
    pub stride: usize,
    pub activation: bool,
    pub norm: bool,
    pub bias: bool,
    pub num_groups: usize,
    pub weight_init_factor: f64,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            stride: 1,
            activation: true,
            norm: true,
            bias: true,
            num_groups: DEFAULT_NUM_GROUPS,
            weight_init_factor: 1.0,
        }
    }
}

impl ConvOptions {
    pub fn kernel(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn activation(mut self, activation: bool) -> Self {
        self.activation = activation;
        self
    }

    pub fn norm(mut self, norm: bool) -> Self {
        self.norm = norm;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn groups(mut self, num_groups: usize) -> Self {
        self.num_groups = num_groups;
        self
    }

    pub fn weight_init(mut self, factor: f64) -> Self {
        self.weight_init_factor = factor;
        self
    }
}

/// Convolution followed by optional group norm and SiLU
#[derive(Module, Debug)]
pub struct ConvGnSilu<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<GroupNorm<B>>,
    pub activation: bool,
}

impl<B: Backend> ConvGnSilu<B> {
    pub fn new(in_channels: usize, out_channels: usize, options: ConvOptions, device: &B::Device) -> Self {
        let conv = conv2d(
            in_channels,
            out_channels,
            options.kernel_size,
            options.stride,
            options.bias,
            device,
        );
        Self {
            conv: scale_weights(conv, options.weight_init_factor),
            norm: options
                .norm
                .then(|| GroupNorm::new(options.num_groups, out_channels, device)),
            activation: options.activation,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        if self.activation {
            silu(x)
        } else {
            x
        }
    }
}

/// Convolution followed by optional normalization and a leaky ReLU
///
/// Normalization is per-sample group norm so a block behaves the same at
/// batch size 1 as in training batches.
#[derive(Module, Debug)]
pub struct ConvLelu<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<GroupNorm<B>>,
    pub activation: bool,
}

impl<B: Backend> ConvLelu<B> {
    pub fn new(in_channels: usize, out_channels: usize, options: ConvOptions, device: &B::Device) -> Self {
        let conv = conv2d(
            in_channels,
            out_channels,
            options.kernel_size,
            options.stride,
            options.bias,
            device,
        );
        Self {
            conv: scale_weights(conv, options.weight_init_factor),
            norm: options
                .norm
                .then(|| GroupNorm::new(options.num_groups, out_channels, device)),
            activation: options.activation,
        }
    }

    /// Plain conv + leaky ReLU without normalization, the most common form
    pub fn plain(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self::new(in_channels, out_channels, ConvOptions::default().norm(false), device)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        if self.activation {
            leaky_relu(x, LELU_SLOPE)
        } else {
            x
        }
    }
}

/// Stack of [`ConvLelu`] units with a learned output scale and bias
///
/// The last unit has neither activation nor normalization.
#[derive(Module, Debug)]
pub struct MultiConvBlock<B: Backend> {
    pub convs: Vec<ConvLelu<B>>,
    pub scale: Param<Tensor<B, 1>>,
    pub bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> MultiConvBlock<B> {
    /// Creates a block of `kernel_sizes.len()` convolutions (at least two)
    ///
    /// # Arguments
    ///
    /// * `filters_in` / `filters_mid` / `filters_out` - Channel widths
    /// * `kernel_sizes` - One kernel size per layer
    /// * `norm` - Normalize the hidden layers
    /// * `weight_init_factor` - Multiplier applied to initial conv weights
    pub fn new(
        filters_in: usize,
        filters_mid: usize,
        filters_out: usize,
        kernel_sizes: &[usize],
        norm: bool,
        weight_init_factor: f64,
        device: &B::Device,
    ) -> Self {
        let depth = kernel_sizes.len();
        debug_assert!(depth >= 2, "MultiConvBlock needs at least two layers");

        let hidden = ConvOptions::default()
            .norm(norm)
            .bias(false)
            .weight_init(weight_init_factor);

        let mut convs = Vec::with_capacity(depth);
        convs.push(ConvLelu::new(filters_in, filters_mid, hidden.kernel(kernel_sizes[0]), device));
        for &k in &kernel_sizes[1..depth - 1] {
            convs.push(ConvLelu::new(filters_mid, filters_mid, hidden.kernel(k), device));
        }
        convs.push(ConvLelu::new(
            filters_mid,
            filters_out,
            hidden
                .kernel(kernel_sizes[depth - 1])
                .activation(false)
                .norm(false),
            device,
        ));

        Self {
            convs,
            scale: Param::from_tensor(Tensor::ones([1], device)),
            bias: Param::from_tensor(Tensor::zeros([1], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for conv in &self.convs {
            x = conv.forward(x);
        }
        x * self.scale.val().reshape([1, 1, 1, 1]) + self.bias.val().reshape([1, 1, 1, 1])
    }
}

/// Stride-2 conv that halves the resolution and doubles the width,
/// followed by a normalized 3x3 conv
#[derive(Module, Debug)]
pub struct HalvingBlock<B: Backend> {
    pub down: ConvGnSilu<B>,
    pub process: ConvGnSilu<B>,
}

impl<B: Backend> HalvingBlock<B> {
    pub fn new(filters: usize, device: &B::Device) -> Self {
        Self {
            down: ConvGnSilu::new(
                filters,
                filters * 2,
                ConvOptions::default().stride(2).norm(false).bias(false),
                device,
            ),
            process: ConvGnSilu::new(filters * 2, filters * 2, ConvOptions::default().bias(false), device),
        }
    }

    /// `[b, f, h, w]` -> `[b, 2f, h/2, w/2]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.process.forward(self.down.forward(x))
    }
}

/// How an expansion stage fuses the upsampled features with its skip tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipFusion {
    /// Normalized decimation, concat, then a single conv back to width
    #[default]
    Concat,
    /// Activated decimation, concat kept at double width, then reduced
    Wide,
}

/// Doubles resolution and halves the width, fusing a skip tensor recorded
/// by the matching [`HalvingBlock`]
#[derive(Module, Debug)]
pub struct ExpansionBlock<B: Backend> {
    pub decimate: ConvGnSilu<B>,
    pub process_passthrough: ConvGnSilu<B>,
    pub conjoin: ConvGnSilu<B>,
    pub process: ConvGnSilu<B>,
}

impl<B: Backend> ExpansionBlock<B> {
    pub fn new(filters_in: usize, fusion: SkipFusion, device: &B::Device) -> Self {
        let out = filters_in / 2;
        let base = ConvOptions::default();
        match fusion {
            SkipFusion::Concat => Self {
                decimate: ConvGnSilu::new(filters_in, out, base.kernel(1).bias(false).activation(false), device),
                process_passthrough: ConvGnSilu::new(out, out, base.activation(false), device),
                conjoin: ConvGnSilu::new(out * 2, out, base.bias(false).norm(false), device),
                process: ConvGnSilu::new(out, out, base.bias(false), device),
            },
            SkipFusion::Wide => Self {
                decimate: ConvGnSilu::new(filters_in, out, base.kernel(1).bias(false).norm(false), device),
                process_passthrough: ConvGnSilu::new(out, out, base.norm(false), device),
                conjoin: ConvGnSilu::new(out * 2, out * 2, base.bias(false).norm(false), device),
                process: ConvGnSilu::new(out * 2, out, base.bias(false), device),
            },
        }
    }

    /// `[b, f, h, w]` + skip `[b, f/2, 2h, 2w]` -> `[b, f/2, 2h, 2w]`
    pub fn forward(&self, x: Tensor<B, 4>, passthrough: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.decimate.forward(upsample_nearest(x, 2));
        let p = self.process_passthrough.forward(passthrough);
        let x = self.conjoin.forward(Tensor::cat(vec![x, p], 1));
        self.process.forward(x)
    }
}

/// Nearest-neighbour upsampling by an integer factor
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Tensor<B, 4> {
    if factor == 1 {
        return x;
    }
    let [b, c, h, w] = x.dims();

    let x = x.reshape([b, c, h, 1, w, 1]);
    let x = x.repeat_dim(3, factor).repeat_dim(5, factor);
    x.reshape([b, c, h * factor, w * factor])
}
