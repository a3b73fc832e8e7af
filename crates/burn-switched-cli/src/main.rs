//! burn-switched CLI
//!
//! Runs a switched residual generator over an image on the CPU and prints
//! temperature schedules.
//!
//! Supports:
//! - Upscaling a PNG, optionally exporting attention maps
//! - Printing the temperature schedule of a configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::prelude::*;
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand, ValueEnum};
use image::{ImageBuffer, Rgb};
use tracing_subscriber::EnvFilter;

use burn_switched::{PassMode, PngAttentionSink, SwitchedGeneratorConfig};

type CpuBackend = NdArray<f32>;

/// Built-in generator configurations
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Preset {
    /// One switching layer of four branches at width 16
    #[default]
    Small,
    /// Four switching layers of eight branches at width 64, 4x upsampling
    X4,
}

#[derive(Parser)]
#[command(name = "burn-switched")]
#[command(about = "Switched residual generator in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// JSON generator config (overrides --preset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preset used when no config file is given
    #[arg(long, value_enum, default_value_t = Preset::Small)]
    preset: Preset,

    /// Treat the config file as a network options object
    #[arg(long, requires = "config")]
    network_options: bool,

    /// Upsample factor for network options
    #[arg(long, default_value_t = 2)]
    scale: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the generator over an image
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Input image
        #[arg(short, long)]
        input: PathBuf,

        /// Output image path
        #[arg(short, long, default_value = "output.png")]
        output: PathBuf,

        /// Export attention maps and debug values under this directory
        #[arg(long)]
        diagnostics: Option<PathBuf>,

        /// Training step whose scheduled temperature to use; without it the
        /// generator runs fully annealed
        #[arg(long)]
        step: Option<u64>,
    },

    /// Print the temperature schedule
    Schedule {
        #[command(flatten)]
        config: ConfigArgs,

        /// Steps to evaluate (comma separated); defaults to evenly spaced
        /// samples through the end of the schedule
        #[arg(long, value_delimiter = ',')]
        steps: Vec<u64>,
    },
}

fn load_config(args: &ConfigArgs) -> Result<SwitchedGeneratorConfig> {
    let Some(path) = &args.config else {
        return Ok(match args.preset {
            Preset::Small => SwitchedGeneratorConfig::small(),
            Preset::X4 => SwitchedGeneratorConfig::x4(),
        });
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;

    let config = if args.network_options {
        SwitchedGeneratorConfig::from_network_options(&value, args.scale)?
    } else {
        let config: SwitchedGeneratorConfig =
            serde_json::from_value(value).context("Invalid generator config")?;
        config.validate()?;
        config
    };
    Ok(config)
}

fn load_image(path: &Path, device: &<CpuBackend as Backend>::Device) -> Result<Tensor<CpuBackend, 4>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);

    let data: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    let hwc = Tensor::<CpuBackend, 3>::from_data(TensorData::new(data, [h, w, 3]), device);
    Ok(hwc.permute([2, 0, 1]).unsqueeze())
}

fn save_image(image: Tensor<CpuBackend, 4>, path: &Path) -> Result<()> {
    let [_, _, h, w] = image.dims();
    let rgb_data: Vec<u8> = image
        .slice([0..1, 0..3, 0..h, 0..w])
        .reshape([3, h, w])
        .clamp(0.0, 1.0)
        .permute([1, 2, 0])
        .into_data()
        .iter::<f32>()
        .map(|v| (v * 255.0).round() as u8)
        .collect();

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(w as u32, h as u32, rgb_data).context("Failed to create image buffer")?;
    img.save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;
    Ok(())
}

fn run(
    config: &ConfigArgs,
    input: &Path,
    output: &Path,
    diagnostics: Option<&Path>,
    step: Option<u64>,
) -> Result<()> {
    let config = load_config(config)?;
    let device = Default::default();

    let mut generator = config.init::<CpuBackend>(&device)?;
    let temperature = step.map_or(1.0, |s| generator.schedule().temperature_at(s));
    generator.set_temperature(temperature)?;
    // Train mode only lifts the annealed-temperature requirement here
    generator.freeze_for_inference();
    let mode = if temperature == 1.0 { PassMode::Eval } else { PassMode::Train };

    let x = load_image(input, &device)?;
    let [_, _, h, w] = x.dims();

    tracing::info!(width = w, height = h, temperature, ?mode, "running generator");
    let pass = generator.forward(x, mode)?;
    save_image(pass.image.clone(), output)?;
    println!("Saved to: {}", output.display());

    if let Some(dir) = diagnostics {
        let values = generator.get_debug_values(step.unwrap_or(0), &pass);
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let debug_path = dir.join("debug_values.json");
        std::fs::write(&debug_path, serde_json::to_string_pretty(&values)?)
            .with_context(|| format!("Failed to write {}", debug_path.display()))?;

        // Round down onto the cadence so the export fires
        let export_step = step.unwrap_or(0);
        let cadence = generator.diagnostic_cadence as u64;
        let aligned = export_step - export_step % cadence;
        generator.update_for_step(aligned, &pass, dir, &mut PngAttentionSink)?;
        println!("Diagnostics written to: {}", dir.display());
    }

    Ok(())
}

fn print_schedule(config: &ConfigArgs, steps: &[u64]) -> Result<()> {
    let config = load_config(config)?;
    let schedule = config.schedule();

    let steps = if steps.is_empty() {
        let end = schedule
            .heightened_final_step
            .unwrap_or(schedule.final_step)
            .max(schedule.final_step);
        (0..=10).map(|i| end * i / 10).collect()
    } else {
        steps.to_vec()
    };

    println!("step\ttemperature");
    for step in steps {
        println!("{step}\t{:.4}", schedule.temperature_at(step));
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            output,
            diagnostics,
            step,
        } => run(&config, &input, &output, diagnostics.as_deref(), step),
        Commands::Schedule { config, steps } => print_schedule(&config, &steps),
    }
}
