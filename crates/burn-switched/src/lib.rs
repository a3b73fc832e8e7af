//! Switched residual generator
//!
//! Image-to-image upscaling built from switching layers. Each layer runs a
//! set of candidate branch transforms on the same input, and a small
//! multiplexer network scores every branch at every pixel. The branch
//! outputs are blended under the per-pixel softmax of those scores, so
//! branches specialise on different local content while the whole network
//! stays differentiable.
//!
//! # Modules
//!
//! - [`switch`] - Temperature-scaled per-pixel routing
//! - [`attention_norm`] - Occupancy tracking that keeps branches from starving
//! - [`multiplexer`] - Networks producing the routing logits
//! - [`branch`] - Branch transform descriptors
//! - [`computer`] - One complete switching layer
//! - [`generator`] - The generator, its temperature schedule and diagnostics
//! - [`config`] - Generator configuration and presets
//!
//! # Example
//!
//! ```ignore
//! use burn_switched::{PassMode, PngAttentionSink, SwitchedGeneratorConfig};
//!
//! let mut generator = SwitchedGeneratorConfig::small().init::<B>(&device)?;
//! for step in 0..steps {
//!     let pass = generator.forward(batch, PassMode::Train)?;
//!     // ... loss on pass.image, backward, optimizer step ...
//!     generator.update_for_step(step, &pass, &experiment_dir, &mut PngAttentionSink)?;
//! }
//! ```

pub mod attention_norm;
pub mod branch;
pub mod computer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod generator;
pub mod multiplexer;
pub mod schedule;
pub mod switch;

pub use attention_norm::{AttentionNorm, LocalReducer, NormReducer};
pub use branch::{BranchSpec, BranchTransform, KernelSizes};
pub use computer::{PassMode, SwitchComputer, SwitchComputerConfig, SwitchComputerOutput, SwitchForward};
pub use config::{MultiplexerKind, SwitchedGeneratorConfig};
pub use diagnostics::{attention_specificity, AttentionSink, DebugValue, DebugValues, PngAttentionSink};
pub use error::{DiagnosticsError, SwitchError};
pub use generator::{GeneratorOutput, SwitchedGenerator};
pub use multiplexer::{gather_2d, Multiplexer, MultiplexerConfig, MultiplexerInput, ReferenceImageBranch};
pub use schedule::TemperatureSchedule;
pub use switch::{SwitchCore, SwitchOutput};
