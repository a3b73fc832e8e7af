//! Activation recomputation strategy
//!
//! burn decides whether backward passes retain or recompute activations at
//! the backend level: `Autodiff<B, BalancedCheckpointing>` recomputes
//! memory-bound intermediates instead of storing them. [`Recompute`] is the
//! orchestration-side switch that marks which sub-computations are
//! candidates, so a layer applies one policy uniformly instead of branching
//! per call site. Running a block under either policy yields identical
//! values.

use serde::{Deserialize, Serialize};

/// Whether a sub-computation retains its activations or marks them for
/// recomputation during backward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recompute {
    #[default]
    Retain,
    Checkpoint,
}

impl Recompute {
    pub fn from_flag(recompute: bool) -> Self {
        if recompute {
            Recompute::Checkpoint
        } else {
            Recompute::Retain
        }
    }

    pub fn is_checkpoint(self) -> bool {
        matches!(self, Recompute::Checkpoint)
    }

    /// Runs `block` under this policy
    pub fn run<T>(self, label: &'static str, block: impl FnOnce() -> T) -> T {
        match self {
            Recompute::Retain => block(),
            Recompute::Checkpoint => {
                let _span = tracing::trace_span!("recompute", block = label).entered();
                block()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies_produce_identical_results() {
        let f = |x: f32| (x * 3.0).sin() + x;
        let retained = Recompute::Retain.run("f", || f(0.7));
        let checkpointed = Recompute::Checkpoint.run("f", || f(0.7));
        assert_eq!(retained, checkpointed);
    }

    #[test]
    fn test_from_flag() {
        assert_eq!(Recompute::from_flag(true), Recompute::Checkpoint);
        assert_eq!(Recompute::from_flag(false), Recompute::Retain);
        assert!(Recompute::Checkpoint.is_checkpoint());
    }
}
