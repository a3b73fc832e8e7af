//! Building blocks for switched residual generators
//!
//! The convolutional units that the switching layers are assembled from.
//!
//! # Modules
//!
//! - [`blocks`] - Conv/norm/activation units, halving and expansion stages,
//!   nearest-neighbour upsampling
//! - [`groupnorm`] - Group normalization
//! - [`recompute`] - Activation recomputation strategy
//!
//! # Example
//!
//! ```ignore
//! use burn_switched_core::blocks::{ConvGnSilu, ConvOptions};
//!
//! let conv = ConvGnSilu::new(64, 128, ConvOptions::default().stride(2), &device);
//! let y = conv.forward(x); // [b, 128, h/2, w/2]
//! ```

pub mod blocks;
pub mod groupnorm;
pub mod recompute;

pub use blocks::{
    upsample_nearest, ConvGnSilu, ConvLelu, ConvOptions, ExpansionBlock, HalvingBlock,
    MultiConvBlock, SkipFusion,
};
pub use groupnorm::GroupNorm;
pub use recompute::Recompute;
