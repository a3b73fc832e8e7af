//! Switched residual generator
//!
//! A 7x7 stem, a stack of switching layers, then nearest-neighbour
//! upsampling through a short conv tail to a 3-channel image. The generator
//! also owns the temperature schedule and the periodic attention exports.

use std::path::Path;

use burn::module::Ignored;
use burn::prelude::*;

use burn_switched_core::blocks::{upsample_nearest, ConvLelu};
use burn_switched_core::Recompute;

use crate::attention_norm::{LocalReducer, NormReducer};
use crate::computer::{PassMode, SwitchComputer, SwitchForward};
use crate::diagnostics::{attention_specificity, AttentionSink, DebugValue, DebugValues};
use crate::error::{DiagnosticsError, Result, SwitchError};
use crate::schedule::TemperatureSchedule;

/// Top-k used by the specificity diagnostics
const SPECIFICITY_TOP_K: usize = 2;

/// Everything one forward pass produces
#[derive(Debug, Clone)]
pub struct GeneratorOutput<B: Backend> {
    /// [batch, 3, height * f, width * f]
    pub image: Tensor<B, 4>,
    /// One [batch, T, height, width] map per switching layer
    pub attentions: Vec<Tensor<B, 4>>,
    /// Detached copy of the input
    pub input_reference: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct SwitchedGenerator<B: Backend> {
    pub initial_conv: ConvLelu<B>,
    pub switches: Vec<SwitchComputer<B>>,
    pub upconv1: ConvLelu<B>,
    pub upconv2: ConvLelu<B>,
    pub hr_conv: ConvLelu<B>,
    pub final_conv: ConvLelu<B>,
    pub upsample_factor: usize,
    pub diagnostic_cadence: usize,
    pub schedule: Ignored<TemperatureSchedule>,
    pub recompute: Ignored<Recompute>,
}

impl<B: Backend> SwitchedGenerator<B> {
    /// Upscales `x` `[batch, 3, height, width]`
    pub fn forward(&mut self, x: Tensor<B, 4>, mode: PassMode) -> Result<GeneratorOutput<B>> {
        if !mode.is_train() && self.temperature() != 1.0 {
            return Err(SwitchError::EvalTemperature(self.temperature()));
        }

        let input_reference = x.clone().detach();
        let recompute = *self.recompute;

        let mut x = self.initial_conv.forward(x);
        let mut attentions = Vec::with_capacity(self.switches.len());
        for switch in self.switches.iter_mut() {
            let out = switch.forward(x, SwitchForward::default().mode(mode).recompute(recompute))?;
            x = out.output;
            attentions.push(out.attention);
        }

        let mut x = self.upconv1.forward(upsample_nearest(x, 2));
        if self.upsample_factor == 4 {
            x = upsample_nearest(x, 2);
        }
        let x = self.upconv2.forward(x);
        let image = self.final_conv.forward(self.hr_conv.forward(x));

        Ok(GeneratorOutput {
            image,
            attentions,
            input_reference,
        })
    }

    /// Current temperature of the switching layers
    pub fn temperature(&self) -> f64 {
        self.switches.first().map_or(1.0, |s| s.temperature())
    }

    /// Sets the temperature of every switching layer
    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        for switch in self.switches.iter_mut() {
            switch.set_temperature(temperature)?;
        }
        Ok(())
    }

    pub fn schedule(&self) -> &TemperatureSchedule {
        &self.schedule
    }

    /// Enables or disables accumulator updates in every layer's normalizer
    pub fn set_update_attention_norm(&mut self, enabled: bool) {
        for switch in self.switches.iter_mut() {
            switch.update_norm = enabled;
        }
    }

    /// Enables or disables the training noise in every layer
    pub fn set_add_noise(&mut self, enabled: bool) {
        for switch in self.switches.iter_mut() {
            switch.add_noise = enabled;
        }
    }

    /// Leaves the generator's state untouched by later training passes
    ///
    /// Stops accumulator updates and training noise, so a pass at an
    /// unannealed temperature is a pure function of the input.
    pub fn freeze_for_inference(&mut self) {
        self.set_update_attention_norm(false);
        self.set_add_noise(false);
    }

    pub fn reduce_attention_norms(&mut self, reducer: &dyn NormReducer<B>) {
        for switch in self.switches.iter_mut() {
            switch.reduce_norm(reducer);
        }
    }

    /// Advances the generator to `step` within a single process
    ///
    /// See [`SwitchedGenerator::update_for_step_with`].
    pub fn update_for_step(
        &mut self,
        step: u64,
        pass: &GeneratorOutput<B>,
        output_directory: &Path,
        sink: &mut dyn AttentionSink<B>,
    ) -> std::result::Result<f64, DiagnosticsError> {
        self.update_for_step_with(step, pass, output_directory, sink, &LocalReducer)
    }

    /// Reduces the attention accumulators, applies the scheduled temperature
    /// and, every `diagnostic_cadence` steps, exports `pass` to
    /// `output_directory/attention_maps`
    ///
    /// Returns the temperature now in effect.
    pub fn update_for_step_with(
        &mut self,
        step: u64,
        pass: &GeneratorOutput<B>,
        output_directory: &Path,
        sink: &mut dyn AttentionSink<B>,
        reducer: &dyn NormReducer<B>,
    ) -> std::result::Result<f64, DiagnosticsError> {
        self.reduce_attention_norms(reducer);

        let temperature = self.schedule.temperature_at(step);
        if temperature != self.temperature() {
            tracing::debug!(step, temperature, "switch temperature updated");
        }
        self.set_temperature(temperature)?;

        if step % self.diagnostic_cadence as u64 == 0 {
            export_attention_maps(step, pass, &output_directory.join("attention_maps"), sink)?;
        }
        Ok(temperature)
    }

    /// Scalar and histogram summaries of `pass`
    ///
    /// Keys: `switch_temperature`, and per layer `i`
    /// `switch_{i}_specificity`, `switch_{i}_histogram` and, when the layer
    /// normalizes attention, `switch_{i}_attention_norm_histogram`.
    pub fn get_debug_values(&self, _step: u64, pass: &GeneratorOutput<B>) -> DebugValues {
        let mut values = DebugValues::new();
        values.insert("switch_temperature".into(), DebugValue::Scalar(self.temperature()));

        for (i, attention) in pass.attentions.iter().enumerate() {
            let (specificity, histogram) = attention_specificity(attention, SPECIFICITY_TOP_K);
            values.insert(format!("switch_{i}_specificity"), DebugValue::Scalar(specificity));
            values.insert(format!("switch_{i}_histogram"), DebugValue::Histogram(histogram));
        }

        for (i, switch) in self.switches.iter().enumerate() {
            if let Some(norm) = switch.attention_norm() {
                values.insert(
                    format!("switch_{i}_attention_norm_histogram"),
                    DebugValue::Histogram(norm.histogram()),
                );
            }
        }
        values
    }
}

/// Writes `amap_{step}_a{layer}_{item}.png` per layer and batch item, and
/// `amap_{step}_base_image.png` for the input
fn export_attention_maps<B: Backend>(
    step: u64,
    pass: &GeneratorOutput<B>,
    directory: &Path,
    sink: &mut dyn AttentionSink<B>,
) -> std::result::Result<(), DiagnosticsError> {
    for (layer, attention) in pass.attentions.iter().enumerate() {
        let [batch, t, h, w] = attention.dims();
        for item in 0..batch {
            let map = attention
                .clone()
                .detach()
                .slice([item..item + 1, 0..t, 0..h, 0..w])
                .reshape([t, h, w]);
            sink.save_attention(&directory.join(format!("amap_{step}_a{layer}_{item}.png")), map)?;
        }
    }

    let [b, c, h, w] = pass.input_reference.dims();
    let reference = pass.input_reference.clone().slice([0..b, 0..c.min(3), 0..h, 0..w]);
    sink.save_reference(&directory.join(format!("amap_{step}_base_image.png")), reference)?;

    tracing::info!(
        step,
        layers = pass.attentions.len(),
        directory = %directory.display(),
        "exported attention maps"
    );
    Ok(())
}
