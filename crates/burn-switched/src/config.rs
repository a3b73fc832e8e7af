//! Generator configuration
//!
//! [`SwitchedGeneratorConfig`] describes a whole generator. It can be built
//! from a preset, deserialized directly, or translated from a network
//! options object with [`SwitchedGeneratorConfig::from_network_options`].

use burn::module::Ignored;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use burn_switched_core::blocks::{ConvLelu, ConvOptions};
use burn_switched_core::{Recompute, SkipFusion};

use crate::branch::{BranchSpec, KernelSizes};
use crate::computer::SwitchComputerConfig;
use crate::error::{Result, SwitchError};
use crate::generator::SwitchedGenerator;
use crate::multiplexer::MultiplexerConfig;
use crate::schedule::TemperatureSchedule;

/// Which multiplexer every switching layer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplexerKind {
    #[default]
    Plain,
    QueryKey,
    /// Query/key scoring with 3x3 neighbourhood stages
    QueryKeyPyramid,
}

/// Switched residual generator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchedGeneratorConfig {
    /// Number of switching layers
    pub switch_depth: usize,
    /// Multiplexer stem width
    pub switch_filters: usize,
    /// Halving stages in each multiplexer
    pub switch_reductions: usize,
    /// Bottleneck convs in each multiplexer
    pub switch_processing_layers: usize,
    /// Branches per switching layer
    pub trans_counts: usize,
    pub trans_kernel_sizes: KernelSizes,
    /// Convs per branch
    pub trans_layers: usize,
    /// Width of the trunk and of every branch
    pub transformation_filters: usize,
    pub attention_norm: bool,
    #[serde(default = "default_initial_temp")]
    pub initial_temp: f64,
    #[serde(default = "default_final_temperature_step")]
    pub final_temperature_step: u64,
    #[serde(default = "default_heightened_temp_min")]
    pub heightened_temp_min: f64,
    #[serde(default = "default_heightened_final_step")]
    pub heightened_final_step: Option<u64>,
    #[serde(default = "default_upsample_factor")]
    pub upsample_factor: usize,
    #[serde(default)]
    pub add_scalable_noise_to_transforms: bool,
    #[serde(default)]
    pub multiplexer: MultiplexerKind,
    #[serde(default = "default_anorm_multiplier")]
    pub anorm_multiplier: usize,
    #[serde(default)]
    pub feed_transforms_into_multiplexer: bool,
    #[serde(default = "default_true")]
    pub post_switch_conv: bool,
    /// Steps between attention map exports
    #[serde(default = "default_diagnostic_cadence")]
    pub diagnostic_cadence: usize,
    #[serde(default)]
    pub recompute: bool,
}

fn default_initial_temp() -> f64 {
    20.0
}

fn default_final_temperature_step() -> u64 {
    50_000
}

fn default_heightened_temp_min() -> f64 {
    1.0
}

fn default_heightened_final_step() -> Option<u64> {
    Some(50_000)
}

fn default_upsample_factor() -> usize {
    2
}

fn default_anorm_multiplier() -> usize {
    16
}

fn default_diagnostic_cadence() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Network option keys that are named differently in the config
const OPTION_RENAMES: &[(&str, &str)] = &[
    ("temperature", "initial_temp"),
    ("temperature_final_step", "final_temperature_step"),
    ("add_noise", "add_scalable_noise_to_transforms"),
];

/// Network option keys consumed elsewhere
const OPTION_SKIPPED: &[&str] = &["which_model_G", "type", "scale", "upsample_factor"];

/// Config field a network option key deserializes into
fn option_field(key: &str) -> &str {
    OPTION_RENAMES
        .iter()
        .find(|(from, _)| *from == key)
        .map_or(key, |(_, to)| *to)
}

/// Every config field name
fn config_fields() -> Result<Map<String, Value>> {
    match serde_json::to_value(SwitchedGeneratorConfig::small()) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(SwitchError::InvalidConfig("config does not serialize to an object".into())),
        Err(e) => Err(SwitchError::InvalidConfig(format!("config fields: {e}"))),
    }
}

impl SwitchedGeneratorConfig {
    /// A single switching layer with four branches, small enough for tests
    pub fn small() -> Self {
        Self {
            switch_depth: 1,
            switch_filters: 16,
            switch_reductions: 2,
            switch_processing_layers: 2,
            trans_counts: 4,
            trans_kernel_sizes: KernelSizes::Uniform(3),
            trans_layers: 2,
            transformation_filters: 16,
            attention_norm: true,
            initial_temp: default_initial_temp(),
            final_temperature_step: default_final_temperature_step(),
            heightened_temp_min: default_heightened_temp_min(),
            heightened_final_step: default_heightened_final_step(),
            upsample_factor: 2,
            add_scalable_noise_to_transforms: false,
            multiplexer: MultiplexerKind::Plain,
            anorm_multiplier: default_anorm_multiplier(),
            feed_transforms_into_multiplexer: false,
            post_switch_conv: true,
            diagnostic_cadence: default_diagnostic_cadence(),
            recompute: false,
        }
    }

    /// The 4x super-resolution setup: 4 switches of 8 branches at width 64
    pub fn x4() -> Self {
        Self {
            switch_depth: 4,
            switch_filters: 64,
            switch_reductions: 3,
            switch_processing_layers: 2,
            trans_counts: 8,
            trans_kernel_sizes: KernelSizes::Uniform(3),
            trans_layers: 3,
            transformation_filters: 64,
            upsample_factor: 4,
            heightened_temp_min: 0.1,
            heightened_final_step: Some(90_000),
            recompute: true,
            ..Self::small()
        }
    }

    pub fn with_upsample_factor(mut self, factor: usize) -> Self {
        self.upsample_factor = factor;
        self
    }

    pub fn with_multiplexer(mut self, multiplexer: MultiplexerKind) -> Self {
        self.multiplexer = multiplexer;
        self
    }

    /// Translates a network options object
    ///
    /// Option keys follow the training option files (`temperature`,
    /// `temperature_final_step`, `add_noise`, ...). The upsample factor
    /// always comes from `scale`. A `for_video` key is accepted and ignored.
    pub fn from_network_options(options: &Value, scale: usize) -> Result<Self> {
        let source = options
            .as_object()
            .ok_or_else(|| SwitchError::InvalidConfig("network options must be an object".into()))?;

        let known = config_fields()?;
        let mut translated = Map::new();
        for (key, value) in source {
            if key == "for_video" {
                tracing::warn!(value = %value, "for_video is not supported by this generator; ignoring");
                continue;
            }
            if OPTION_SKIPPED.contains(&key.as_str()) {
                continue;
            }
            let key = option_field(key);
            if !known.contains_key(key) {
                tracing::warn!(key, "unknown network option; ignoring");
                continue;
            }
            let value = match (key, value) {
                // A zero end step disables the heightened phase
                ("heightened_final_step", Value::Number(n)) if n.as_u64() == Some(0) => Value::Null,
                _ => value.clone(),
            };
            translated.insert(key.to_string(), value);
        }
        translated.insert("upsample_factor".into(), Value::from(scale));

        let config: Self = serde_json::from_value(Value::Object(translated))
            .map_err(|e| SwitchError::InvalidConfig(format!("network options: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Keys of `options` that are neither config fields nor consumed
    /// elsewhere; [`Self::from_network_options`] ignores them with a warning
    pub fn unknown_network_options(options: &Value) -> Result<Vec<String>> {
        let known = config_fields()?;
        Ok(options
            .as_object()
            .into_iter()
            .flatten()
            .map(|(key, _)| key)
            .filter(|key| key.as_str() != "for_video" && !OPTION_SKIPPED.contains(&key.as_str()))
            .filter(|key| !known.contains_key(option_field(key)))
            .cloned()
            .collect())
    }

    pub fn schedule(&self) -> TemperatureSchedule {
        TemperatureSchedule {
            initial_temp: self.initial_temp,
            final_step: self.final_temperature_step,
            heightened_temp_min: self.heightened_temp_min,
            heightened_final_step: self.heightened_final_step,
        }
    }

    /// Configuration shared by every switching layer
    pub fn switch_config(&self) -> Result<SwitchComputerConfig> {
        let filters = self.transformation_filters;
        let branch = BranchSpec::multi_conv(filters, &self.trans_kernel_sizes, self.trans_layers)?;
        let multiplexer = match self.multiplexer {
            MultiplexerKind::Plain => MultiplexerConfig::Plain {
                input_channels: filters,
                base_filters: self.switch_filters,
                reductions: self.switch_reductions,
                processing_depth: self.switch_processing_layers,
                branch_count: self.trans_counts,
                fusion: SkipFusion::Concat,
                feed_transforms: self.feed_transforms_into_multiplexer,
            },
            MultiplexerKind::QueryKey | MultiplexerKind::QueryKeyPyramid => MultiplexerConfig::QueryKey {
                filters,
                branch_count: self.trans_counts,
                reductions: self.switch_reductions,
                embedding_channels: None,
                pyramid: self.multiplexer == MultiplexerKind::QueryKeyPyramid,
            },
        };

        Ok(SwitchComputerConfig {
            initial_temperature: self.initial_temp,
            attention_norm: self.attention_norm,
            anorm_multiplier: self.anorm_multiplier,
            add_noise: self.add_scalable_noise_to_transforms,
            post_switch_conv: self.post_switch_conv,
            ..SwitchComputerConfig::new(branch, self.trans_counts, multiplexer)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.upsample_factor, 2 | 4) {
            return Err(SwitchError::InvalidUpsampleFactor(self.upsample_factor));
        }
        if self.switch_depth == 0 {
            return Err(SwitchError::InvalidConfig("switch_depth must be at least 1".into()));
        }
        if self.diagnostic_cadence == 0 {
            return Err(SwitchError::InvalidConfig("diagnostic_cadence must be positive".into()));
        }
        self.schedule().validate()?;
        self.switch_config()?.validate()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SwitchedGenerator<B>> {
        self.validate()?;

        let nf = self.transformation_filters;
        let switch = self.switch_config()?;
        let switches = (0..self.switch_depth)
            .map(|_| switch.init(device))
            .collect::<Result<Vec<_>>>()?;

        let linear = ConvOptions::default().norm(false).activation(false);
        tracing::debug!(
            depth = self.switch_depth,
            branches = self.trans_counts,
            filters = nf,
            upsample = self.upsample_factor,
            "built switched generator"
        );

        Ok(SwitchedGenerator {
            initial_conv: ConvLelu::new(3, nf, linear.kernel(7), device),
            switches,
            upconv1: ConvLelu::plain(nf, nf, device),
            upconv2: ConvLelu::plain(nf, nf, device),
            hr_conv: ConvLelu::plain(nf, nf, device),
            final_conv: ConvLelu::new(nf, 3, linear, device),
            upsample_factor: self.upsample_factor,
            diagnostic_cadence: self.diagnostic_cadence,
            schedule: Ignored(self.schedule()),
            recompute: Ignored(Recompute::from_flag(self.recompute)),
        })
    }
}
