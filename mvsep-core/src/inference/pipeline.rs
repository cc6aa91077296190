use std::path::Path;

use tracing::{debug, warn};

use super::chunking::{ChunkPlan, OverlapAdd};
use crate::{
    audio::{read_wav, write_wav, Waveform},
    config::{InferenceConfig, TransformConfig},
    dsp::{analyze, denormalize, normalize, synthesize, ComplexSpectrogram},
    listener::{signal_stats, ChunkStats, PipelineEvent, PipelineListener},
    model::SourceEstimator,
    Result, SeparationError, AUDIO_CHANNELS,
};

/// Removes the estimated source from a long recording, one chunk at a time.
///
/// Every chunk goes through the same steps:
///   1. STFT, split into magnitude and phase
///   2. Standardize the magnitude with the chunk's own statistics
///   3. Ask the estimator for the source magnitude and subtract it
///   4. Undo the standardization, recombine with the input phase, inverse STFT
///
/// Chunks are then stitched with [`OverlapAdd`] and the result is clipped to
/// `[-1, 1]`. The estimator's phase prediction is not used for synthesis.
pub struct ChunkedSeparator<'a, E> {
    estimator: &'a E,
    n_fft: usize,
    hop_length: usize,
    chunk_size: usize,
    overlap: usize,
    pad_tail: bool,
}

impl<'a, E: SourceEstimator> ChunkedSeparator<'a, E> {
    pub fn new(
        estimator: &'a E,
        transform: &TransformConfig,
        inference: &InferenceConfig,
    ) -> Result<Self> {
        transform.validate()?;
        inference.validate(transform)?;
        Ok(Self {
            estimator,
            n_fft: transform.n_fft,
            hop_length: transform.hop_length,
            chunk_size: inference.chunk_size,
            overlap: inference.overlap,
            pad_tail: inference.pad_tail,
        })
    }

    /// Chunk layout this separator would use for `total` samples.
    pub fn plan(&self, total: usize) -> Result<ChunkPlan> {
        ChunkPlan::new(total, self.chunk_size, self.overlap, self.pad_tail)
    }

    /// Read `input`, separate it and write the result to `output`.
    pub fn separate_file(
        &self,
        input: &Path,
        output: &Path,
        listener: &mut impl PipelineListener,
    ) -> Result<Waveform> {
        let waveform = read_wav(input)?;
        let separated = self.separate(&waveform, listener)?;
        write_wav(output, &separated)?;
        Ok(separated)
    }

    /// Separate a stereo waveform. The output has the input's length; samples
    /// not covered by any chunk are silent.
    pub fn separate(
        &self,
        input: &Waveform,
        listener: &mut impl PipelineListener,
    ) -> Result<Waveform> {
        if input.num_channels() != AUDIO_CHANNELS {
            return Err(SeparationError::Shape(format!(
                "separation expects {AUDIO_CHANNELS} channels, got {}",
                input.num_channels()
            )));
        }
        let plan = self.plan(input.len())?;
        let chunks = plan.count();
        if chunks == 0 {
            warn!(
                samples = input.len(),
                chunk_size = self.chunk_size,
                "input shorter than one chunk, output is silent"
            );
        } else if plan.dropped_tail() > 0 {
            warn!(
                dropped = plan.dropped_tail(),
                "trailing samples are not covered by a full chunk"
            );
        }

        let mut output = OverlapAdd::new(
            AUDIO_CHANNELS,
            plan.padded_len(),
            self.chunk_size,
            self.overlap,
            input.sample_rate(),
        );

        listener.on_event(PipelineEvent::InferenceStarted {
            total_samples: input.len(),
            chunks,
            dropped_tail: plan.dropped_tail(),
        });

        for (index, start) in plan.starts().enumerate() {
            // Only the padded tail chunk reads past the input.
            let chunk = input.window(start, self.chunk_size);
            let (separated, stats) = self.separate_chunk(&chunk, listener)?;
            output.add(start, &separated)?;
            debug!(index, start, "chunk stitched");
            listener.on_event(PipelineEvent::ChunkDone {
                index,
                total: chunks,
                stats,
            });
        }

        let mut result = output.into_clipped()?;
        result.truncate(input.len());
        listener.on_event(PipelineEvent::InferenceDone {
            samples: result.len(),
        });
        Ok(result)
    }

    fn separate_chunk(
        &self,
        chunk: &Waveform,
        listener: &impl PipelineListener,
    ) -> Result<(Waveform, Option<ChunkStats>)> {
        let spectrogram = analyze(chunk, self.n_fft, self.hop_length)?;
        let (magnitude, phase) = spectrogram.to_polar();
        let (normalized, norm) = normalize(&magnitude);

        let (predicted_magnitude, predicted_phase) = self.estimator.estimate(&normalized)?;
        if predicted_magnitude.shape() != normalized.shape() {
            return Err(SeparationError::Shape(format!(
                "estimator returned {:?} for input {:?}",
                predicted_magnitude.shape(),
                normalized.shape()
            )));
        }
        let residual = normalized.sub(&predicted_magnitude)?;

        let stats = listener.wants_stats().then(|| ChunkStats {
            normalized_input: signal_stats(normalized.values()),
            predicted_magnitude: signal_stats(predicted_magnitude.values()),
            predicted_phase: signal_stats(predicted_phase.values()),
            residual_magnitude: signal_stats(residual.values()),
        });

        let restored = denormalize(&residual, &norm)?;
        let complex = ComplexSpectrogram::from_polar(&restored, &phase)?;
        let separated = synthesize(
            &complex,
            self.n_fft,
            self.hop_length,
            chunk.len(),
            chunk.sample_rate(),
        )?;
        Ok((separated, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::Spectral;
    use crate::listener::NoOpListener;

    /// Predicts no source at all, so separation is a pure analysis/synthesis pass.
    struct Silent;

    impl SourceEstimator for Silent {
        fn estimate(&self, normalized: &Spectral) -> Result<(Spectral, Spectral)> {
            Ok((
                Spectral::zeros(normalized.shape()),
                Spectral::zeros(normalized.shape()),
            ))
        }
    }

    /// Predicts the whole normalized magnitude, leaving only its mean behind.
    struct Everything;

    impl SourceEstimator for Everything {
        fn estimate(&self, normalized: &Spectral) -> Result<(Spectral, Spectral)> {
            Ok((normalized.clone(), Spectral::zeros(normalized.shape())))
        }
    }

    fn small() -> (TransformConfig, InferenceConfig) {
        (
            TransformConfig::new().with_n_fft(64).with_hop_length(16),
            InferenceConfig::new().with_chunk_size(256).with_overlap(64),
        )
    }

    fn sine(len: usize) -> Waveform {
        let left = (0..len).map(|i| 0.5 * (i as f32 * 0.05).sin()).collect();
        let right = (0..len).map(|i| 0.3 * (i as f32 * 0.11).cos()).collect();
        Waveform::stereo(left, right, 44100).unwrap()
    }

    #[test]
    fn silent_estimator_reproduces_covered_input() {
        let (transform, inference) = small();
        let separator = ChunkedSeparator::new(&Silent, &transform, &inference).unwrap();
        let input = sine(1000);

        let out = separator.separate(&input, &mut NoOpListener).unwrap();
        assert_eq!(out.len(), input.len());

        let plan = separator.plan(input.len()).unwrap();
        let last = plan.last_sample().unwrap();
        for c in 0..2 {
            for i in 0..=last {
                let err = (out.channel(c)[i] - input.channel(c)[i]).abs();
                assert!(err < 1e-3, "channel {c} sample {i}: error {err}");
            }
            assert!(out.channel(c)[last + 1..].iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn padded_tail_reaches_the_end() {
        let (transform, inference) = small();
        let inference = inference.with_pad_tail(true);
        let separator = ChunkedSeparator::new(&Silent, &transform, &inference).unwrap();
        let input = sine(1000);

        let out = separator.separate(&input, &mut NoOpListener).unwrap();
        assert_eq!(out.len(), 1000);
        assert!((out.channel(0)[999] - input.channel(0)[999]).abs() < 1e-3);
    }

    #[test]
    fn removing_everything_leaves_little_energy() {
        let (transform, inference) = small();
        let separator = ChunkedSeparator::new(&Everything, &transform, &inference).unwrap();
        let input = sine(1000);

        let out = separator.separate(&input, &mut NoOpListener).unwrap();
        let energy = |w: &Waveform| w.channel(0)[..700].iter().map(|x| x * x).sum::<f32>();
        assert!(energy(&out) < energy(&input));
    }

    #[test]
    fn short_input_is_silent() {
        let (transform, inference) = small();
        let separator = ChunkedSeparator::new(&Silent, &transform, &inference).unwrap();
        let out = separator.separate(&sine(100), &mut NoOpListener).unwrap();
        assert_eq!(out.len(), 100);
        assert!(out.channels().iter().flatten().all(|&x| x == 0.0));
    }

    #[test]
    fn rejects_mono_input() {
        let (transform, inference) = small();
        let separator = ChunkedSeparator::new(&Silent, &transform, &inference).unwrap();
        let mono = Waveform::silence(1, 1000, 44100);
        assert!(separator.separate(&mono, &mut NoOpListener).is_err());
    }

    #[test]
    fn rejects_invalid_geometry() {
        let transform = TransformConfig::new().with_n_fft(64).with_hop_length(16);
        let inference = InferenceConfig::new().with_chunk_size(256).with_overlap(256);
        assert!(ChunkedSeparator::new(&Silent, &transform, &inference).is_err());
    }
}
