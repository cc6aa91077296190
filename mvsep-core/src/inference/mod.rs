//! Chunked inference over full-length recordings.

pub mod chunking;
pub mod pipeline;

pub use chunking::{ChunkPlan, OverlapAdd};
pub use pipeline::ChunkedSeparator;

use crate::{audio::Waveform, Result, SeparationError};

/// Signal-to-distortion ratio of `estimate` against `reference`, in dB,
/// pooled over all channels.
///
/// A perfect estimate gives `+inf`; a silent reference gives `-inf` unless the
/// estimate is silent too.
pub fn sdr_db(reference: &Waveform, estimate: &Waveform) -> Result<f64> {
    if reference.num_channels() != estimate.num_channels() || reference.len() != estimate.len() {
        return Err(SeparationError::Shape(format!(
            "reference {}x{} and estimate {}x{} differ in shape",
            reference.num_channels(),
            reference.len(),
            estimate.num_channels(),
            estimate.len()
        )));
    }
    let (mut signal, mut distortion) = (0.0f64, 0.0f64);
    for (r, e) in reference.channels().iter().zip(estimate.channels()) {
        for (&a, &b) in r.iter().zip(e) {
            signal += (a as f64).powi(2);
            distortion += (a as f64 - b as f64).powi(2);
        }
    }
    Ok(match (signal > 0.0, distortion > 0.0) {
        (_, false) => f64::INFINITY,
        (false, true) => f64::NEG_INFINITY,
        (true, true) => 10.0 * (signal / distortion).log10(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdr_of_known_ratio() {
        let reference = Waveform::stereo(vec![1.0; 100], vec![1.0; 100], 44100).unwrap();
        let estimate = Waveform::stereo(vec![0.9; 100], vec![1.1; 100], 44100).unwrap();
        // signal 200, distortion 200 * 0.01
        let sdr = sdr_db(&reference, &estimate).unwrap();
        assert!((sdr - 20.0).abs() < 1e-4, "{sdr}");
    }

    #[test]
    fn sdr_edge_cases() {
        let tone = Waveform::stereo(vec![0.5; 8], vec![-0.5; 8], 44100).unwrap();
        let silence = Waveform::silence(2, 8, 44100);
        assert_eq!(sdr_db(&tone, &tone).unwrap(), f64::INFINITY);
        assert_eq!(sdr_db(&silence, &tone).unwrap(), f64::NEG_INFINITY);
        assert!(sdr_db(&tone, &Waveform::silence(2, 9, 44100)).is_err());
    }
}
