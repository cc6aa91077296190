//! Training tracks and fixed-length `(mixture, target)` samples.

use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    audio::{read_wav, Waveform},
    config::{DatasetConfig, TransformConfig},
    dsp::{analyze, normalize, Spectral},
    Result, SeparationError,
};

/// One training example.
///
/// The spectrograms are normalized magnitudes of exactly `segment_frames`
/// frames; the waveforms are the full tracks truncated to their common length.
#[derive(Debug, Clone)]
pub struct Sample {
    pub track: usize,
    pub mixture: Spectral,
    pub target: Spectral,
    pub mixture_audio: Waveform,
    pub target_audio: Waveform,
}

/// A directory with one sub-directory per track, each holding the mixture and
/// target files.
#[derive(Debug, Clone)]
pub struct TrackDataset {
    tracks: Vec<PathBuf>,
    config: DatasetConfig,
    transform: TransformConfig,
}

impl TrackDataset {
    /// Discover tracks under `config.data_dir`, sorted by name.
    pub fn open(config: &DatasetConfig, transform: &TransformConfig) -> Result<Self> {
        let mut tracks = Vec::new();
        for entry in std::fs::read_dir(&config.data_dir).map_err(|e| {
            SeparationError::Dataset(format!("{}: {e}", config.data_dir.display()))
        })? {
            let path = entry?.path();
            if path.is_dir() {
                tracks.push(path);
            }
        }
        tracks.sort();

        if tracks.is_empty() {
            return Err(SeparationError::Dataset(format!(
                "no track directories in {}",
                config.data_dir.display()
            )));
        }
        info!(
            tracks = tracks.len(),
            dir = %config.data_dir.display(),
            "dataset opened"
        );

        Ok(Self {
            tracks,
            config: config.clone(),
            transform: transform.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    /// Frames per training segment.
    pub fn segment_frames(&self) -> usize {
        self.config.segment_frames(&self.transform)
    }

    /// Seed used to shuffle `epoch`, if the dataset is seeded.
    pub(crate) fn epoch_seed(&self, epoch: usize) -> Option<u64> {
        self.config.seed.map(|seed| mix(seed, epoch as u64, u64::MAX))
    }

    /// Load, transform and cut track `index` for `epoch`.
    ///
    /// Unseeded datasets draw a fresh window on every call; seeded ones always
    /// return the same window for the same `(epoch, index)`.
    pub fn sample(&self, index: usize, epoch: usize) -> Result<Sample> {
        let dir = self.tracks.get(index).ok_or_else(|| {
            SeparationError::Dataset(format!(
                "track index {index} out of range ({} tracks)",
                self.tracks.len()
            ))
        })?;

        let (mixture_audio, target_audio) = self.load_pair(dir)?;

        let (mixture, _) = normalize(
            &analyze(&mixture_audio, self.transform.n_fft, self.transform.hop_length)?.magnitude(),
        );
        let (target, _) = normalize(
            &analyze(&target_audio, self.transform.n_fft, self.transform.hop_length)?.magnitude(),
        );

        let segment = self.segment_frames();
        let frames = mixture.frames();
        let start = if frames > segment {
            let mut rng = match self.config.seed {
                Some(seed) => StdRng::seed_from_u64(mix(seed, epoch as u64, index as u64)),
                None => StdRng::from_entropy(),
            };
            rng.gen_range(0..frames - segment)
        } else {
            0
        };
        debug!(track = index, frames, start, segment, "sample window");

        Ok(Sample {
            track: index,
            mixture: mixture.frame_window(start, segment),
            target: target.frame_window(start, segment),
            mixture_audio,
            target_audio,
        })
    }

    fn load_pair(&self, dir: &Path) -> Result<(Waveform, Waveform)> {
        let mixture_path = dir.join(&self.config.mixture_file);
        let target_path = dir.join(&self.config.target_file);
        for path in [&mixture_path, &target_path] {
            if !path.is_file() {
                return Err(SeparationError::Dataset(format!(
                    "missing {}",
                    path.display()
                )));
            }
        }

        let mut mixture = read_wav(&mixture_path)?;
        let mut target = read_wav(&target_path)?;
        if mixture.sample_rate() != target.sample_rate() {
            return Err(SeparationError::Dataset(format!(
                "{}: mixture is {} Hz but target is {} Hz",
                dir.display(),
                mixture.sample_rate(),
                target.sample_rate()
            )));
        }
        if mixture.sample_rate() != self.transform.sample_rate {
            return Err(SeparationError::Dataset(format!(
                "{}: tracks are {} Hz but the session runs at {} Hz",
                dir.display(),
                mixture.sample_rate(),
                self.transform.sample_rate
            )));
        }

        let len = mixture.len().min(target.len());
        mixture.truncate(len);
        target.truncate(len);
        Ok((mixture, target))
    }
}

/// Combine a seed with two counters into an independent stream seed.
fn mix(seed: u64, a: u64, b: u64) -> u64 {
    let mut z = seed
        ^ a.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ b.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use std::f32::consts::PI;

    fn transform() -> TransformConfig {
        TransformConfig::new()
            .with_n_fft(64)
            .with_hop_length(16)
            .with_sample_rate(8000)
    }

    fn tone(len: usize, freq: f32, sr: u32) -> Waveform {
        let ch: Vec<f32> = (0..len)
            .map(|i| 0.3 * (2.0 * PI * freq * i as f32 / sr as f32).sin())
            .collect();
        Waveform::stereo(ch.clone(), ch, sr).unwrap()
    }

    fn write_track(root: &Path, name: &str, mix_len: usize, target_len: usize) {
        write_track_at(root, name, mix_len, target_len, 8000);
    }

    fn write_track_at(root: &Path, name: &str, mix_len: usize, target_len: usize, sr: u32) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        write_wav(&dir.join("other.wav"), &tone(mix_len, 440.0, sr)).unwrap();
        write_wav(&dir.join("vocals.wav"), &tone(target_len, 220.0, sr)).unwrap();
    }

    #[test]
    fn tracks_are_sorted_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "b", 800, 800);
        write_track(dir.path(), "a", 800, 800);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let ds = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &transform()).unwrap();
        assert_eq!(ds.len(), 2);
        assert!(ds.tracks()[0].ends_with("a"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &transform());
        assert!(matches!(err, Err(SeparationError::Dataset(_))));
    }

    #[test]
    fn long_track_is_windowed_and_truncated_to_shared_length() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "t", 4000, 3000);
        let cfg = DatasetConfig::new(dir.path().into()).with_segment_length(640);
        let ds = TrackDataset::open(&cfg, &transform()).unwrap();

        let s = ds.sample(0, 0).unwrap();
        assert_eq!(s.mixture.shape(), [2, 33, 40]);
        assert_eq!(s.target.shape(), [2, 33, 40]);
        assert_eq!(s.mixture_audio.len(), 3000);
        assert_eq!(s.target_audio.len(), 3000);
    }

    #[test]
    fn short_track_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "t", 320, 320);
        let cfg = DatasetConfig::new(dir.path().into()).with_segment_length(1600);
        let ds = TrackDataset::open(&cfg, &transform()).unwrap();

        let s = ds.sample(0, 0).unwrap();
        // 1 + 320/16 = 21 real frames, padded to 100
        assert_eq!(s.mixture.shape(), [2, 33, 100]);
        let plane = s.mixture.channel(0);
        assert!(plane[21..100].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn seeded_windows_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "t", 8000, 8000);
        let cfg = DatasetConfig::new(dir.path().into())
            .with_segment_length(320)
            .with_seed(Some(7));
        let ds = TrackDataset::open(&cfg, &transform()).unwrap();

        assert_eq!(ds.sample(0, 3).unwrap().mixture, ds.sample(0, 3).unwrap().mixture);
    }

    #[test]
    fn mono_file_is_a_channel_count_error() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "t", 800, 800);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(dir.path().join("t/vocals.wav"), spec).unwrap();
        for _ in 0..800 {
            w.write_sample(0i16).unwrap();
        }
        w.finalize().unwrap();

        let ds = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &transform()).unwrap();
        assert!(matches!(
            ds.sample(0, 0),
            Err(SeparationError::ChannelCount { found: 1, .. })
        ));
    }

    #[test]
    fn tracks_must_match_the_session_rate() {
        let dir = tempfile::tempdir().unwrap();
        write_track_at(dir.path(), "a", 800, 800, 8000);
        write_track_at(dir.path(), "b", 800, 800, 48000);
        write_track_at(dir.path(), "c", 800, 800, 8000);

        let ds = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &transform()).unwrap();
        assert!(ds.sample(0, 0).is_ok());
        assert!(matches!(ds.sample(1, 0), Err(SeparationError::Dataset(_))));
        assert!(ds.sample(2, 0).is_ok());

        let at_44k = TransformConfig::new().with_n_fft(64).with_hop_length(16);
        let ds = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &at_44k).unwrap();
        assert!(matches!(ds.sample(0, 0), Err(SeparationError::Dataset(_))));
    }

    #[test]
    fn missing_target_is_a_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        write_track(dir.path(), "t", 800, 800);
        std::fs::remove_file(dir.path().join("t/vocals.wav")).unwrap();

        let ds = TrackDataset::open(&DatasetConfig::new(dir.path().into()), &transform()).unwrap();
        assert!(matches!(ds.sample(0, 0), Err(SeparationError::Dataset(_))));
    }
}
