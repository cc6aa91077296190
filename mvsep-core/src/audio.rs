//! Waveform container and WAV I/O.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{Result, SeparationError, AUDIO_CHANNELS};

/// A multi-channel signal stored channel-major.
///
/// Any channel count can be held so that loaders can report the actual count;
/// every processing stage requires [`AUDIO_CHANNELS`] channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl Waveform {
    /// Build a waveform from per-channel sample vectors.
    ///
    /// All channels must have the same length.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if let Some(first) = channels.first() {
            let len = first.len();
            if channels.iter().any(|c| c.len() != len) {
                return Err(SeparationError::Shape(
                    "all waveform channels must have the same length".to_string(),
                ));
            }
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn stereo(left: Vec<f32>, right: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![left, right], sample_rate)
    }

    /// All-zero waveform with `channels` channels of `len` samples.
    pub fn silence(channels: usize, len: usize, sample_rate: u32) -> Self {
        Self {
            channels: vec![vec![0.0; len]; channels],
            sample_rate,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Copy of samples `[start, start + len)` of every channel. Positions past
    /// the end read as zero, so the result always has `len` samples.
    pub fn window(&self, start: usize, len: usize) -> Waveform {
        let channels = self
            .channels
            .iter()
            .map(|c| {
                let from = start.min(c.len());
                let to = start.saturating_add(len).min(c.len());
                let mut out = Vec::with_capacity(len);
                out.extend_from_slice(&c[from..to]);
                out.resize(len, 0.0);
                out
            })
            .collect();
        Waveform {
            channels,
            sample_rate: self.sample_rate,
        }
    }

    /// Keep only the first `len` samples of every channel.
    pub fn truncate(&mut self, len: usize) {
        self.channels.iter_mut().for_each(|c| c.truncate(len));
    }

    /// Fail with [`SeparationError::ChannelCount`] unless the waveform is stereo.
    pub fn ensure_stereo(&self, origin: &Path) -> Result<()> {
        if self.num_channels() != AUDIO_CHANNELS {
            return Err(SeparationError::ChannelCount {
                path: origin.to_path_buf(),
                found: self.num_channels(),
            });
        }
        Ok(())
    }
}

/// Read a WAV file into a [`Waveform`], rejecting anything but stereo.
///
/// Integer PCM is scaled to [-1, 1); float PCM is taken as-is.
pub fn read_wav(path: &Path) -> Result<Waveform> {
    let mut reader = WavReader::open(path).map_err(|e| SeparationError::audio(path, e))?;
    let spec = reader.spec();
    let n_channels = spec.channels as usize;

    if n_channels != AUDIO_CHANNELS {
        return Err(SeparationError::ChannelCount {
            path: path.to_path_buf(),
            found: n_channels,
        });
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| SeparationError::audio(path, e))?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SeparationError::audio(path, e))?,
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (ch, &s) in channels.iter_mut().zip(frame) {
            ch.push(s);
        }
    }

    Waveform::new(channels, spec.sample_rate)
}

/// Write a waveform as a 32-bit float WAV file.
pub fn write_wav(path: &Path, waveform: &Waveform) -> Result<()> {
    let spec = WavSpec {
        channels: waveform.num_channels() as u16,
        sample_rate: waveform.sample_rate(),
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| SeparationError::audio(path, e))?;

    for i in 0..waveform.len() {
        for ch in waveform.channels() {
            writer
                .write_sample(ch[i])
                .map_err(|e| SeparationError::audio(path, e))?;
        }
    }

    writer
        .finalize()
        .map_err(|e| SeparationError::audio(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_channels() {
        assert!(Waveform::new(vec![vec![0.0; 4], vec![0.0; 3]], 44100).is_err());
    }

    #[test]
    fn window_copies_every_channel() {
        let w = Waveform::stereo(vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0], 8000).unwrap();
        let s = w.window(1, 2);
        assert_eq!(s.channel(0), &[2.0, 3.0]);
        assert_eq!(s.channel(1), &[6.0, 7.0]);
        assert_eq!(s.sample_rate(), 8000);
    }

    #[test]
    fn window_past_the_end_is_zero_filled() {
        let w = Waveform::stereo(vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0], 8000).unwrap();
        assert_eq!(w.window(3, 3).channel(1), &[8.0, 0.0, 0.0]);
        assert_eq!(w.window(10, 2).channel(0), &[0.0, 0.0]);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn ensure_stereo_reports_count() {
        let mono = Waveform::silence(1, 10, 44100);
        match mono.ensure_stereo(Path::new("mono.wav")) {
            Err(SeparationError::ChannelCount { found, .. }) => assert_eq!(found, 1),
            other => panic!("expected ChannelCount, got {other:?}"),
        }
    }

    #[test]
    fn wav_round_trip_preserves_float_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let w = Waveform::stereo(vec![0.25, -0.5, 0.75], vec![-1.0, 0.0, 1.0], 22050).unwrap();

        write_wav(&path, &w).unwrap();
        let back = read_wav(&path).unwrap();

        assert_eq!(back, w);
    }

    #[test]
    fn read_rejects_mono_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..16 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        assert!(matches!(
            read_wav(&path),
            Err(SeparationError::ChannelCount { found: 1, .. })
        ));
    }
}
