//! Error types
//!
//! Every error here is a configuration or usage fault. Nothing is retried.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Branch count mismatch: {transforms} transforms but multiplexer produces {multiplexer} logits")]
    BranchCountMismatch { transforms: usize, multiplexer: usize },

    #[error("Invalid upsample factor {0}: only 2 and 4 are supported")]
    InvalidUpsampleFactor(usize),

    #[error("Invalid temperature {0}: must be finite and positive")]
    InvalidTemperature(f64),

    #[error("Temperature is {0} in an evaluation pass; evaluation requires exactly 1")]
    EvalTemperature(f64),

    #[error("Multiplexer requires an embedding but none was given")]
    MissingEmbedding,

    #[error("Embedding spatial size {actual:?} does not match bottleneck size {expected:?}")]
    EmbeddingShape {
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("Gather index must be [{batch}, 2] but is {actual:?}")]
    GatherIndex { batch: usize, actual: [usize; 2] },

    #[error("Input {height}x{width} is not divisible by {factor}")]
    IndivisibleInput {
        height: usize,
        width: usize,
        factor: usize,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Tensor data error: {0}")]
    Data(String),

    #[error(transparent)]
    Switch(#[from] SwitchError),
}

pub type Result<T, E = SwitchError> = std::result::Result<T, E>;
