//! Attention normalization
//!
//! Tracks how much of each pass every branch receives and biases routing
//! away from branches that have historically dominated, so no branch starves.

use burn::module::Param;
use burn::prelude::*;

/// Largest bonus or penalty (in logit units) the correction may apply
pub const MAX_CORRECTION: f64 = 2.772_588_722_239_781; // ln(16)

const MIN_NORM: f64 = 1e-6;

/// Reduces accumulator state across replicas before it is read
///
/// Multi-device training would average the rings of every replica here.
/// Within a single process [`LocalReducer`] leaves the ring as it is.
pub trait NormReducer<B: Backend> {
    fn all_reduce_mean(&self, accumulator: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Single-process reducer
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl<B: Backend> NormReducer<B> for LocalReducer {
    fn all_reduce_mean(&self, accumulator: Tensor<B, 2>) -> Tensor<B, 2> {
        accumulator
    }
}

/// Rolling per-branch occupancy accumulator with a balancing correction
///
/// Each observed pass writes one row of relative occupancy (a perfectly
/// balanced pass is all ones) into a ring of `capacity` rows. Once the ring
/// has wrapped, [`AttentionNorm::correction`] returns a bounded per-branch
/// logit bias of `-ln(norm)`, scaled by a learned strength.
#[derive(Module, Debug)]
pub struct AttentionNorm<B: Backend> {
    /// Ring of occupancy rows, shape [capacity, branch_count]
    pub accumulator: Tensor<B, 2>,
    /// Learned multiplier on the correction, starts at 1
    pub strength: Param<Tensor<B, 1>>,
    pub branch_count: usize,
    pub capacity: usize,
    /// Next ring slot to write
    pub index: usize,
    /// Set once the ring has wrapped
    pub filled: bool,
}

impl<B: Backend> AttentionNorm<B> {
    /// Creates a normalizer for `branch_count` branches holding
    /// `capacity` rows of history
    pub fn new(branch_count: usize, capacity: usize, device: &B::Device) -> Self {
        Self {
            accumulator: Tensor::zeros([capacity.max(1), branch_count], device),
            strength: Param::from_tensor(Tensor::ones([1], device)),
            branch_count,
            capacity: capacity.max(1),
            index: 0,
            filled: false,
        }
    }

    /// Records the relative per-branch occupancy of one attention map
    ///
    /// `attention` is `[batch, branch_count, height, width]`.
    pub fn observe(&mut self, attention: &Tensor<B, 4>) {
        let t = self.branch_count;
        let totals = attention
            .clone()
            .detach()
            .sum_dim(0)
            .sum_dim(2)
            .sum_dim(3)
            .reshape([1, t]);
        let mean = totals.clone().mean().reshape([1, 1]);
        let occupancy = totals / mean;

        self.accumulator = self
            .accumulator
            .clone()
            .slice_assign([self.index..self.index + 1, 0..t], occupancy);

        self.index += 1;
        if self.index >= self.capacity {
            self.index = 0;
            if !self.filled {
                tracing::debug!(
                    branches = t,
                    capacity = self.capacity,
                    "attention norm accumulator filled"
                );
            }
            self.filled = true;
        }
    }

    /// Mean occupancy per branch over the ring, all ones until it has filled
    pub fn buffer_norm(&self) -> Tensor<B, 1> {
        if self.filled {
            self.accumulator
                .clone()
                .mean_dim(0)
                .reshape([self.branch_count])
        } else {
            Tensor::ones([self.branch_count], &self.accumulator.device())
        }
    }

    /// Per-branch logit bias, `None` until the ring has filled
    ///
    /// Decreasing in historical occupancy and clamped to
    /// `±MAX_CORRECTION` before the learned strength is applied.
    pub fn correction(&self) -> Option<Tensor<B, 1>> {
        if !self.filled {
            return None;
        }
        let norm = self.buffer_norm();
        let norm = norm.clone() / norm.mean();
        let bias = norm
            .clamp_min(MIN_NORM)
            .log()
            .neg()
            .clamp(-MAX_CORRECTION, MAX_CORRECTION);
        Some(bias * self.strength.val())
    }

    /// Occupancy histogram: bin `t` holds `floor(10 * norm_t)` counts
    pub fn histogram(&self) -> Vec<u64> {
        self.buffer_norm()
            .into_data()
            .iter::<f32>()
            .map(|v| (v.max(0.0) * 10.0).floor() as u64)
            .collect()
    }

    /// Passes the ring through `reducer`
    pub fn reduce(&mut self, reducer: &dyn NormReducer<B>) {
        self.accumulator = reducer.all_reduce_mean(self.accumulator.clone());
    }
}
