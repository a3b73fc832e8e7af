//! Switch core: temperature-scaled per-pixel routing over branch outputs
//!
//! Given `T` candidate outputs and `T` routing logits per pixel, computes a
//! softmax over the branch axis and blends the candidates under it. Unlike
//! top-k expert routing, every branch contributes to every pixel, so the
//! layer stays differentiable end to end.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::attention_norm::{AttentionNorm, NormReducer};
use crate::error::{Result, SwitchError};

/// Result of blending one branch stack
#[derive(Debug, Clone)]
pub struct SwitchOutput<B: Backend> {
    /// Blended features: [batch, channels, height, width]
    pub mixed: Tensor<B, 4>,
    /// Per-pixel distribution over branches: [batch, T, height, width]
    pub attention: Tensor<B, 4>,
    /// The routing logits as produced by the multiplexer
    pub logits: Tensor<B, 4>,
}

/// Softmax routing with temperature and optional attention normalization
#[derive(Module, Debug)]
pub struct SwitchCore<B: Backend> {
    pub attention_norm: Option<AttentionNorm<B>>,
    temperature: f64,
}

fn check_temperature(temperature: f64) -> Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(SwitchError::InvalidTemperature(temperature))
    }
}

impl<B: Backend> SwitchCore<B> {
    /// Creates a switch starting at `initial_temperature`
    pub fn new(initial_temperature: f64, attention_norm: Option<AttentionNorm<B>>) -> Result<Self> {
        check_temperature(initial_temperature)?;
        Ok(Self {
            attention_norm,
            temperature: initial_temperature,
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        check_temperature(temperature)?;
        self.temperature = temperature;
        Ok(())
    }

    /// Blends `branches` under the softmax of `logits / temperature`
    ///
    /// # Arguments
    ///
    /// * `branches` - Branch stack [batch, T, channels, height, width]
    /// * `logits` - Routing logits [batch, T, height, width]
    /// * `update_accumulator` - Record this pass in the attention norm
    pub fn combine(
        &mut self,
        branches: Tensor<B, 5>,
        logits: Tensor<B, 4>,
        update_accumulator: bool,
    ) -> SwitchOutput<B> {
        let [b, t, c, h, w] = branches.dims();
        debug_assert_eq!(logits.dims(), [b, t, h, w], "logits must match the branch stack");

        // A single branch needs no routing
        if t == 1 {
            return SwitchOutput {
                mixed: branches.reshape([b, c, h, w]),
                attention: Tensor::ones([b, 1, h, w], &logits.device()),
                logits,
            };
        }

        let scaled = logits.clone() / self.temperature;
        let mut attention = softmax(scaled.clone(), 1);

        if let Some(norm) = self.attention_norm.as_mut() {
            if update_accumulator {
                norm.observe(&attention);
            }
            if let Some(bias) = norm.correction() {
                attention = softmax(scaled + bias.reshape([1, t, 1, 1]), 1);
            }
        }

        let weights = attention.clone().unsqueeze_dim::<5>(2);
        let mixed = (branches * weights).sum_dim(1).reshape([b, c, h, w]);

        SwitchOutput {
            mixed,
            attention,
            logits,
        }
    }

    pub fn reduce_norm(&mut self, reducer: &dyn NormReducer<B>) {
        if let Some(norm) = self.attention_norm.as_mut() {
            norm.reduce(reducer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn kl_to_uniform(attention: Tensor<TestBackend, 4>) -> f32 {
        let t = attention.dims()[1] as f32;
        let p = attention.clamp_min(1e-12);
        let kl = (p.clone() * (p.log() + t.ln())).sum_dim(1).mean();
        kl.into_scalar()
    }

    #[test]
    fn test_attention_is_a_distribution() {
        let device = Default::default();
        let mut switch = SwitchCore::<TestBackend>::new(1.0, None).unwrap();

        let branches = Tensor::random([2, 4, 3, 5, 5], Distribution::Normal(0.0, 1.0), &device);
        let logits = Tensor::random([2, 4, 5, 5], Distribution::Normal(0.0, 5.0), &device);
        let out = switch.combine(branches, logits, true);

        assert_eq!(out.mixed.dims(), [2, 3, 5, 5]);
        assert_eq!(out.attention.dims(), [2, 4, 5, 5]);

        let values: Vec<f32> = out.attention.clone().into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        let sums: Vec<f32> = out.attention.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "attention should sum to 1, got {s}");
        }
    }

    #[test]
    fn test_single_branch_is_identity() {
        let device = Default::default();
        let mut switch = SwitchCore::<TestBackend>::new(20.0, None).unwrap();

        let branch = Tensor::<TestBackend, 4>::random([1, 6, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let logits = Tensor::random([1, 1, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let out = switch.combine(branch.clone().unsqueeze_dim(1), logits, true);

        let expected: Vec<f32> = branch.into_data().to_vec().unwrap();
        let mixed: Vec<f32> = out.mixed.into_data().to_vec().unwrap();
        assert_eq!(expected, mixed);

        let attention: Vec<f32> = out.attention.into_data().to_vec().unwrap();
        assert!(attention.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_mixed_is_weighted_sum() {
        let device = Default::default();
        let mut switch = SwitchCore::<TestBackend>::new(1.0, None).unwrap();

        // Branch 0 is all ones, branch 1 all threes, equal logits -> 2.0
        let branches = Tensor::cat(
            vec![
                Tensor::<TestBackend, 5>::ones([1, 1, 2, 3, 3], &device),
                Tensor::<TestBackend, 5>::ones([1, 1, 2, 3, 3], &device) * 3.0,
            ],
            1,
        );
        let logits = Tensor::zeros([1, 2, 3, 3], &device);
        let mixed: Vec<f32> = switch.combine(branches, logits, false).mixed.into_data().to_vec().unwrap();
        for v in mixed {
            assert!((v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_higher_temperature_flattens_attention() {
        let device = Default::default();
        let branches = Tensor::<TestBackend, 5>::zeros([1, 5, 1, 6, 6], &device);
        let logits = Tensor::<TestBackend, 4>::random([1, 5, 6, 6], Distribution::Normal(0.0, 3.0), &device);

        let mut previous = f32::INFINITY;
        for temperature in [0.5, 1.0, 2.0, 5.0, 20.0, 100.0] {
            let mut switch = SwitchCore::<TestBackend>::new(temperature, None).unwrap();
            let out = switch.combine(branches.clone(), logits.clone(), false);
            let kl = kl_to_uniform(out.attention);
            assert!(kl <= previous + 1e-6, "KL rose from {previous} to {kl} at temperature {temperature}");
            previous = kl;
        }
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        assert!(matches!(
            SwitchCore::<TestBackend>::new(0.0, None),
            Err(SwitchError::InvalidTemperature(_))
        ));

        let mut switch = SwitchCore::<TestBackend>::new(1.0, None).unwrap();
        assert!(switch.set_temperature(-1.0).is_err());
        assert!(switch.set_temperature(f64::NAN).is_err());
        assert_eq!(switch.temperature(), 1.0);
    }

    #[test]
    fn test_eval_pass_leaves_accumulator_untouched() {
        let device = Default::default();
        let norm = AttentionNorm::new(3, 2, &device);
        let mut switch = SwitchCore::<TestBackend>::new(1.0, Some(norm)).unwrap();

        let branches = Tensor::zeros([1, 3, 2, 4, 4], &device);
        let logits = Tensor::random([1, 3, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        switch.combine(branches.clone(), logits.clone(), false);
        assert_eq!(switch.attention_norm.as_ref().unwrap().index, 0);

        switch.combine(branches, logits, true);
        assert_eq!(switch.attention_norm.as_ref().unwrap().index, 1);
    }

    fn branch_share(attention: &Tensor<TestBackend, 4>, branch: usize) -> f32 {
        let [b, _, h, w] = attention.dims();
        attention
            .clone()
            .slice([0..b, branch..branch + 1, 0..h, 0..w])
            .mean()
            .into_scalar()
    }

    #[test]
    fn test_filled_norm_pulls_attention_off_dominant_branch() {
        let device = Default::default();
        let norm = AttentionNorm::new(2, 2, &device);
        let mut switch = SwitchCore::<TestBackend>::new(1.0, Some(norm)).unwrap();

        let branches = Tensor::<TestBackend, 5>::zeros([1, 2, 1, 4, 4], &device);
        let logits = Tensor::cat(
            vec![
                Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device) * 2.0,
                Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device),
            ],
            1,
        );

        // sigmoid(2) while the ring is still filling
        let first = switch.combine(branches.clone(), logits.clone(), true);
        assert!((branch_share(&first.attention, 0) - 0.8808).abs() < 1e-3);

        let second = switch.combine(branches.clone(), logits.clone(), true);
        let share = branch_share(&second.attention, 0);
        assert!(share < 0.6, "dominant branch kept {share} of the attention");
        assert!(branch_share(&second.attention, 1) > 0.4);

        // The correction keeps applying once updates stop
        let frozen = switch.combine(branches, logits, false);
        assert!(branch_share(&frozen.attention, 0) < 0.6);
    }
}
