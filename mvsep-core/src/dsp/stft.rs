use std::{f32::consts::PI, sync::Arc};

use realfft::{num_complex::Complex, ComplexToReal, RealFftPlanner, RealToComplex};

use super::polar::ComplexSpectrogram;
use crate::{audio::Waveform, Result, SeparationError, AUDIO_CHANNELS};

/// Centered Short-Time Fourier Transform (STFT) and its inverse (ISTFT).
///
/// **Forward:**
///   1. Reflect-pad the signal by `n_fft/2` on each side
///   2. Periodic Hann window, one-sided FFT → `n_fft/2 + 1` bins
///   3. `1 + len / hop_length` frames, no spectral normalization
///
/// **Inverse:**
///   1. Inverse FFT per frame (scaled by `1/n_fft`), windowed
///   2. Overlap-add, divided by the summed squared window
///   3. Drop the `n_fft/2` centre pad and trim (or zero-extend) to the target length
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward_plan: Arc<dyn RealToComplex<f32>>,
    inverse_plan: Arc<dyn ComplexToReal<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize) -> Result<Self> {
        if n_fft < 4 || n_fft % 2 != 0 {
            return Err(SeparationError::Config(format!(
                "n_fft must be even and at least 4, got {n_fft}"
            )));
        }
        if hop_length == 0 || hop_length > n_fft / 2 {
            return Err(SeparationError::Config(format!(
                "hop_length must be in 1..={} for n_fft={n_fft}, got {hop_length}",
                n_fft / 2
            )));
        }
        let mut planner = RealFftPlanner::<f32>::new();
        Ok(Stft {
            n_fft,
            hop_length,
            window: hann_window(n_fft),
            forward_plan: planner.plan_fft_forward(n_fft),
            inverse_plan: planner.plan_fft_inverse(n_fft),
        })
    }

    /// Number of frequency bins per frame.
    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for a signal of `len` samples.
    pub fn num_frames(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// Computes the forward STFT of one channel.
    ///
    /// Returns a flat buffer in `[frame × bin]` layout:
    /// `[frame_0_bin_0, ..., frame_0_bin_F, frame_1_bin_0, ...]`
    pub fn forward(&mut self, samples: &[f32]) -> Result<Vec<Complex<f32>>> {
        let pad = self.n_fft / 2;
        if samples.len() <= pad {
            return Err(SeparationError::Shape(format!(
                "signal of {} samples is too short for n_fft={} (needs more than {pad})",
                samples.len(),
                self.n_fft
            )));
        }
        let padded = reflect_pad(samples, pad, pad);
        let num_frames = self.num_frames(samples.len());
        let bins = self.num_bins();

        let mut output: Vec<Complex<f32>> = Vec::with_capacity(num_frames * bins);
        let mut scratch = self.forward_plan.make_scratch_vec();
        let mut frame_freq = self.forward_plan.make_output_vec();
        let mut frame_time = self.forward_plan.make_input_vec();

        for f in 0..num_frames {
            let start = f * self.hop_length;
            frame_time.copy_from_slice(&padded[start..start + self.n_fft]);
            frame_time
                .iter_mut()
                .zip(self.window.iter())
                .for_each(|(x, w)| *x *= w);

            self.forward_plan
                .process_with_scratch(&mut frame_time, &mut frame_freq, &mut scratch)
                .map_err(|e| SeparationError::Dsp(format!("forward FFT failed: {}", e)))?;

            output.extend_from_slice(&frame_freq);
        }

        debug_assert_eq!(output.len(), num_frames * bins);
        Ok(output)
    }

    /// Reconstructs `length` samples of one channel from a `[frame × bin]` spectrogram.
    pub fn inverse(&mut self, spectrogram: &[Complex<f32>], length: usize) -> Result<Vec<f32>> {
        let bins = self.num_bins();
        if spectrogram.len() % bins != 0 {
            return Err(SeparationError::Shape(format!(
                "spectrogram of {} values is not a whole number of {bins}-bin frames",
                spectrogram.len()
            )));
        }
        let num_frames = spectrogram.len() / bins;
        let hl = self.hop_length;

        let padded_len = self.n_fft + hl * num_frames.saturating_sub(1);
        let mut output = vec![0.0f32; padded_len];
        let mut window_sum = vec![0.0f32; padded_len];
        let mut frame_freq = self.inverse_plan.make_input_vec();
        let mut frame_time = self.inverse_plan.make_output_vec();
        let mut scratch = self.inverse_plan.make_scratch_vec();
        let norm = 1.0 / self.n_fft as f32;

        for f in 0..num_frames {
            frame_freq.copy_from_slice(&spectrogram[f * bins..(f + 1) * bins]);

            // realfft requires DC and Nyquist to have zero imaginary part
            frame_freq[0].im = 0.0;
            frame_freq[bins - 1].im = 0.0;

            self.inverse_plan
                .process_with_scratch(&mut frame_freq, &mut frame_time, &mut scratch)
                .map_err(|e| SeparationError::Dsp(format!("inverse FFT failed: {}", e)))?;

            let offset = f * hl;
            for i in 0..self.n_fft {
                output[offset + i] += frame_time[i] * norm * self.window[i];
                window_sum[offset + i] += self.window[i] * self.window[i];
            }
        }

        for (x, w) in output.iter_mut().zip(&window_sum) {
            if *w > 1e-11 {
                *x /= w;
            }
        }

        let start = self.n_fft / 2;
        let mut signal = vec![0.0f32; length];
        let available = padded_len.saturating_sub(start).min(length);
        signal[..available].copy_from_slice(&output[start..start + available]);
        Ok(signal)
    }
}

/// Hann-windowed STFT of every channel of a stereo waveform.
///
/// Output shape is `(channels, n_fft/2 + 1, 1 + len/hop_length)`.
pub fn analyze(waveform: &Waveform, n_fft: usize, hop_length: usize) -> Result<ComplexSpectrogram> {
    if waveform.num_channels() != AUDIO_CHANNELS {
        return Err(SeparationError::Shape(format!(
            "analysis expects {AUDIO_CHANNELS} channels, got {}",
            waveform.num_channels()
        )));
    }
    let mut stft = Stft::new(n_fft, hop_length)?;
    let frames = waveform
        .channels()
        .iter()
        .map(|ch| stft.forward(ch))
        .collect::<Result<Vec<_>>>()?;
    ComplexSpectrogram::from_frame_major(&frames, stft.num_bins())
}

/// Inverse of [`analyze`]: rebuild a waveform of exactly `output_length` samples.
pub fn synthesize(
    spectrogram: &ComplexSpectrogram,
    n_fft: usize,
    hop_length: usize,
    output_length: usize,
    sample_rate: u32,
) -> Result<Waveform> {
    let mut stft = Stft::new(n_fft, hop_length)?;
    if spectrogram.bins() != stft.num_bins() {
        return Err(SeparationError::Shape(format!(
            "spectrogram has {} bins, n_fft={n_fft} expects {}",
            spectrogram.bins(),
            stft.num_bins()
        )));
    }
    let channels = (0..spectrogram.channels())
        .map(|c| stft.inverse(&spectrogram.channel_frame_major(c), output_length))
        .collect::<Result<Vec<_>>>()?;
    Waveform::new(channels, sample_rate)
}

/// Generates a periodic Hann window of length `n_fft`.
fn hann_window(n_fft: usize) -> Vec<f32> {
    (0..n_fft)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n_fft as f32).cos()))
        .collect()
}

/// Pads a signal by mirroring it at both boundaries (edge sample not repeated).
///
/// Requires `left < samples.len()` and `right < samples.len()`.
fn reflect_pad(samples: &[f32], left: usize, right: usize) -> Vec<f32> {
    let n = samples.len();
    let mut padded = Vec::with_capacity(n + left + right);

    // Left: mirror from samples[left] down to samples[1]
    padded.extend((1..=left).rev().map(|i| samples[i]));
    padded.extend_from_slice(samples);
    // Right: mirror from samples[n-2] backwards
    padded.extend((1..=right).map(|i| samples[n - 1 - i]));
    padded
}
