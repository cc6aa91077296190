//! Per-segment, per-channel standardization of magnitude spectrograms.
//!
//! Statistics are taken over frequency and time jointly, separately for each
//! channel. They belong to the segment they were computed from and must be fed
//! back unchanged to [`denormalize`].

use super::polar::Spectral;
use crate::{Result, SeparationError};

/// Added to the standard deviation so silent segments divide by a non-zero value.
pub const NORM_EPSILON: f32 = 1e-8;

/// Per-channel mean and (unbiased) standard deviation of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct NormStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Standardize each channel to zero mean and unit variance.
///
/// Returns the normalized tensor together with the statistics needed to undo it.
pub fn normalize(magnitude: &Spectral) -> (Spectral, NormStats) {
    let mut normalized = magnitude.clone();
    let mut stats = NormStats {
        mean: Vec::with_capacity(magnitude.channels()),
        std: Vec::with_capacity(magnitude.channels()),
    };

    for c in 0..magnitude.channels() {
        let (mean, std) = mean_std(magnitude.channel(c));
        let denom = std + NORM_EPSILON;
        normalized
            .channel_mut(c)
            .iter_mut()
            .for_each(|x| *x = (*x - mean) / denom);
        stats.mean.push(mean);
        stats.std.push(std);
    }

    (normalized, stats)
}

/// Exact inverse of [`normalize`] given the same statistics.
pub fn denormalize(normalized: &Spectral, stats: &NormStats) -> Result<Spectral> {
    if stats.mean.len() != normalized.channels() || stats.std.len() != normalized.channels() {
        return Err(SeparationError::Shape(format!(
            "statistics for {} channels applied to {} channels",
            stats.mean.len(),
            normalized.channels()
        )));
    }
    let mut out = normalized.clone();
    for c in 0..normalized.channels() {
        let (mean, scale) = (stats.mean[c], stats.std[c] + NORM_EPSILON);
        out.channel_mut(c)
            .iter_mut()
            .for_each(|x| *x = *x * scale + mean);
    }
    Ok(out)
}

/// Mean and unbiased standard deviation, accumulated in f64.
fn mean_std(values: &[f32]) -> (f32, f32) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
    if n == 1 {
        return (mean as f32, 0.0);
    }
    let var = values
        .iter()
        .map(|&x| (x as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    (mean as f32, var.sqrt() as f32)
}
