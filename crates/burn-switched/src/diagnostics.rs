//! Attention diagnostics
//!
//! Scalar and histogram summaries of attention maps, and an
//! [`AttentionSink`] that renders maps to PNG.

use std::collections::BTreeMap;
use std::path::Path;

use burn::prelude::*;
use image::{Rgb, RgbImage};
use serde::Serialize;

use crate::error::DiagnosticsError;

/// One named debug value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DebugValue {
    Scalar(f64),
    Histogram(Vec<u64>),
}

/// Debug values keyed by name, in stable order
pub type DebugValues = BTreeMap<String, DebugValue>;

/// How concentrated an attention map is
///
/// Returns the mean over pixels of the summed `top_k` attention weights
/// (1.0 when every pixel commits to at most `top_k` branches, `top_k / T`
/// when attention is uniform) and how often each branch appears among a
/// pixel's `top_k` choices.
pub fn attention_specificity<B: Backend>(attention: &Tensor<B, 4>, top_k: usize) -> (f64, Vec<u64>) {
    let t = attention.dims()[1];
    let k = top_k.clamp(1, t);

    let (values, indices) = attention.clone().detach().topk_with_indices(k, 1);
    let specificity: f64 = values.sum_dim(1).mean().into_scalar().elem();

    let mut counts = vec![0u64; t];
    for index in indices.into_data().iter::<i64>() {
        if let Some(count) = counts.get_mut(index as usize) {
            *count += 1;
        }
    }
    (specificity, counts)
}

/// Destination for exported attention maps and reference images
pub trait AttentionSink<B: Backend> {
    /// Saves one attention map `[T, height, width]`
    fn save_attention(&mut self, path: &Path, attention: Tensor<B, 3>) -> Result<(), DiagnosticsError>;

    /// Saves the input batch `[batch, 3, height, width]`, values in `[0, 1]`
    fn save_reference(&mut self, path: &Path, images: Tensor<B, 4>) -> Result<(), DiagnosticsError>;
}

/// Writes attention maps as PNGs, colouring each pixel by its strongest
/// branch
#[derive(Debug, Clone, Copy, Default)]
pub struct PngAttentionSink;

fn ensure_parent(path: &Path) -> Result<(), DiagnosticsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| DiagnosticsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Fully saturated colour at hue `index / count`
pub fn branch_colour(index: usize, count: usize) -> Rgb<u8> {
    let hue = 6.0 * index as f32 / count.max(1) as f32;
    let sector = hue.floor() as u32 % 6;
    let f = hue - hue.floor();
    let up = (255.0 * f).round() as u8;
    let down = 255 - up;
    match sector {
        0 => Rgb([255, up, 0]),
        1 => Rgb([down, 255, 0]),
        2 => Rgb([0, 255, up]),
        3 => Rgb([0, down, 255]),
        4 => Rgb([up, 0, 255]),
        _ => Rgb([255, 0, down]),
    }
}

impl<B: Backend> AttentionSink<B> for PngAttentionSink {
    fn save_attention(&mut self, path: &Path, attention: Tensor<B, 3>) -> Result<(), DiagnosticsError> {
        let [t, h, w] = attention.dims();
        let winners: Vec<i64> = attention.argmax(0).into_data().iter::<i64>().collect();
        if winners.len() != h * w {
            return Err(DiagnosticsError::Data(format!(
                "expected {} argmax values, got {}",
                h * w,
                winners.len()
            )));
        }

        let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
            branch_colour(winners[y as usize * w + x as usize] as usize, t)
        });

        ensure_parent(path)?;
        img.save(path)?;
        Ok(())
    }

    fn save_reference(&mut self, path: &Path, images: Tensor<B, 4>) -> Result<(), DiagnosticsError> {
        let [b, c, h, w] = images.dims();
        if c != 3 {
            return Err(DiagnosticsError::Data(format!("reference image has {c} channels, expected 3")));
        }

        // Batch laid out side by side: [h, b*w, 3]
        let strip = images
            .clamp(0.0, 1.0)
            .permute([2, 0, 3, 1])
            .reshape([h, b * w, 3]);
        let pixels: Vec<u8> = strip
            .into_data()
            .iter::<f32>()
            .map(|v| (v * 255.0).round() as u8)
            .collect();

        let img = RgbImage::from_raw((b * w) as u32, h as u32, pixels)
            .ok_or_else(|| DiagnosticsError::Data("reference image buffer size mismatch".into()))?;

        ensure_parent(path)?;
        img.save(path)?;
        Ok(())
    }
}
