//! Immutable run configuration.
//!
//! Every record is built once at startup, checked with `validate()` and then
//! passed by reference. The burn `Config` derive gives `new` for required
//! fields, `with_*` builders for the rest and JSON save/load.

use std::path::PathBuf;

use burn::config::Config;

use crate::{SeparationError, AUDIO_CHANNELS};

/// STFT geometry shared by analysis and synthesis.
#[derive(Config, Debug, PartialEq)]
pub struct TransformConfig {
    #[config(default = 4096)]
    pub n_fft: usize,
    #[config(default = 1024)]
    pub hop_length: usize,
    #[config(default = 44100)]
    pub sample_rate: u32,
}

impl TransformConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.n_fft < 4 || self.n_fft % 2 != 0 {
            return Err(SeparationError::Config(format!(
                "n_fft must be even and at least 4, got {}",
                self.n_fft
            )));
        }
        if self.hop_length == 0 || self.hop_length > self.n_fft / 2 {
            return Err(SeparationError::Config(format!(
                "hop_length must be in 1..={}, got {}",
                self.n_fft / 2,
                self.hop_length
            )));
        }
        if self.sample_rate == 0 {
            return Err(SeparationError::Config("sample_rate must be positive".into()));
        }
        Ok(())
    }

    /// Frequency bins produced per frame.
    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }
}

/// Hyper-parameters of the separation network.
#[derive(Config, Debug, PartialEq)]
pub struct ModelConfig {
    #[config(default = 2)]
    pub in_channels: usize,
    #[config(default = 512)]
    pub hidden_size: usize,
    /// Counts the input projection and the output heads, so there are
    /// `num_layers - 2` residual blocks.
    #[config(default = 8)]
    pub num_layers: usize,
    /// Block `i` uses dilation `dilation_rate^i`.
    #[config(default = 2)]
    pub dilation_rate: usize,
    #[config(default = 16)]
    pub reduction_ratio: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.in_channels != AUDIO_CHANNELS {
            return Err(SeparationError::Config(format!(
                "in_channels must be {AUDIO_CHANNELS}, got {}",
                self.in_channels
            )));
        }
        if self.num_layers < 2 {
            return Err(SeparationError::Config(format!(
                "num_layers must be at least 2, got {}",
                self.num_layers
            )));
        }
        if self.reduction_ratio == 0 || self.hidden_size / self.reduction_ratio == 0 {
            return Err(SeparationError::Config(format!(
                "hidden_size {} too small for reduction ratio {}",
                self.hidden_size, self.reduction_ratio
            )));
        }
        if self.dilation_rate == 0 {
            return Err(SeparationError::Config("dilation_rate must be at least 1".into()));
        }
        let deepest = self.num_blocks().saturating_sub(1);
        let fits = u32::try_from(deepest)
            .ok()
            .and_then(|exp| self.dilation_rate.checked_pow(exp))
            .is_some();
        if !fits {
            return Err(SeparationError::Config(format!(
                "dilation {}^{deepest} of the last block overflows",
                self.dilation_rate
            )));
        }
        Ok(())
    }

    pub fn num_blocks(&self) -> usize {
        self.num_layers.saturating_sub(2)
    }

    /// Dilation of residual block `index`. Only defined for configs that pass
    /// [`ModelConfig::validate`].
    pub fn dilation(&self, index: usize) -> usize {
        self.dilation_rate.pow(index as u32)
    }
}

/// Where training tracks live and how they are cut.
#[derive(Config, Debug, PartialEq)]
pub struct DatasetConfig {
    pub data_dir: PathBuf,
    #[config(default = "String::from(\"other.wav\")")]
    pub mixture_file: String,
    #[config(default = "String::from(\"vocals.wav\")")]
    pub target_file: String,
    /// Segment length in samples; the model sees `segment_length / hop_length` frames.
    #[config(default = 352800)]
    pub segment_length: usize,
    /// Fixes the window drawn for each `(epoch, track)` when set.
    pub seed: Option<u64>,
}

impl DatasetConfig {
    pub fn validate(&self, transform: &TransformConfig) -> crate::Result<()> {
        if self.segment_length < transform.hop_length {
            return Err(SeparationError::Config(format!(
                "segment_length {} is shorter than one hop ({})",
                self.segment_length, transform.hop_length
            )));
        }
        if self.mixture_file == self.target_file {
            return Err(SeparationError::Config(format!(
                "mixture and target share the file name {:?}",
                self.mixture_file
            )));
        }
        Ok(())
    }

    pub fn segment_frames(&self, transform: &TransformConfig) -> usize {
        self.segment_length / transform.hop_length
    }
}

/// Optimisation loop settings.
#[derive(Config, Debug, PartialEq)]
pub struct TrainingConfig {
    #[config(default = 10000)]
    pub epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub weight_decay: f32,
    #[config(default = 100)]
    pub checkpoint_steps: usize,
    #[config(default = "PathBuf::from(\".\")")]
    pub checkpoint_dir: PathBuf,
    pub resume_from: Option<PathBuf>,
    #[config(default = 16)]
    pub num_workers: usize,
    /// Batches buffered ahead of the training step.
    #[config(default = 2)]
    pub prefetch: usize,
    #[config(default = "PathBuf::from(\"loss_log.json\")")]
    pub loss_log_path: PathBuf,
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("checkpoint_steps", self.checkpoint_steps),
            ("num_workers", self.num_workers),
            ("prefetch", self.prefetch),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SeparationError::Config(format!("{name} must be positive")));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(SeparationError::Config(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(SeparationError::Config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Sliding-window geometry for chunked inference.
#[derive(Config, Debug, PartialEq)]
pub struct InferenceConfig {
    #[config(default = 16384)]
    pub chunk_size: usize,
    #[config(default = 4096)]
    pub overlap: usize,
    /// Zero-extend the input so the trailing partial chunk is separated too.
    #[config(default = false)]
    pub pad_tail: bool,
}

impl InferenceConfig {
    pub fn validate(&self, transform: &TransformConfig) -> crate::Result<()> {
        if self.overlap >= self.chunk_size {
            return Err(SeparationError::Config(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        if self.chunk_size <= transform.n_fft / 2 {
            return Err(SeparationError::Config(format!(
                "chunk_size {} must exceed n_fft/2 = {}",
                self.chunk_size,
                transform.n_fft / 2
            )));
        }
        Ok(())
    }

    /// Distance between consecutive chunk starts.
    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let transform = TransformConfig::new();
        transform.validate().unwrap();
        ModelConfig::new().validate().unwrap();
        TrainingConfig::new().validate().unwrap();
        InferenceConfig::new().validate(&transform).unwrap();
        DatasetConfig::new(PathBuf::from("data"))
            .validate(&transform)
            .unwrap();
    }

    #[test]
    fn defaults_match_reference_geometry() {
        let transform = TransformConfig::new();
        let dataset = DatasetConfig::new(PathBuf::from("data"));
        assert_eq!(transform.num_bins(), 2049);
        assert_eq!(dataset.segment_frames(&transform), 344);
        assert_eq!(dataset.mixture_file, "other.wav");
        assert_eq!(dataset.target_file, "vocals.wav");
        assert_eq!(InferenceConfig::new().stride(), 12288);
        assert_eq!(ModelConfig::new().num_blocks(), 6);
    }

    #[test]
    fn dilation_grows_geometrically() {
        let config = ModelConfig::new().with_dilation_rate(3);
        let dilations: Vec<usize> = (0..4).map(|i| config.dilation(i)).collect();
        assert_eq!(dilations, vec![1, 3, 9, 27]);
    }

    #[test]
    fn rejects_invalid_records() {
        assert!(ModelConfig::new().with_in_channels(1).validate().is_err());
        assert!(ModelConfig::new().with_num_layers(1).validate().is_err());
        assert!(ModelConfig::new().with_hidden_size(8).validate().is_err());
        assert!(TransformConfig::new().with_hop_length(4096).validate().is_err());
        assert!(TransformConfig::new().with_n_fft(1023).validate().is_err());
        assert!(TrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::new().with_learning_rate(-1.0).validate().is_err());
        assert!(TrainingConfig::new().with_learning_rate(1.5).validate().is_err());
        assert!(TransformConfig::new().with_sample_rate(0).validate().is_err());

        let transform = TransformConfig::new();
        let inference = InferenceConfig::new().with_overlap(16384);
        assert!(inference.validate(&transform).is_err());
        let inference = InferenceConfig::new().with_chunk_size(2048).with_overlap(512);
        assert!(inference.validate(&transform).is_err());
    }

    #[test]
    fn deep_stacks_must_keep_dilation_representable() {
        // 2^(BITS-1) is the largest power of two a usize holds.
        let max_exp = usize::BITS as usize - 1;
        let config = ModelConfig::new().with_num_layers(max_exp + 3);
        config.validate().unwrap();
        assert_eq!(config.dilation(max_exp), 1 << max_exp);

        for layers in [max_exp + 4, 70] {
            assert!(matches!(
                ModelConfig::new().with_num_layers(layers).validate(),
                Err(SeparationError::Config(_))
            ));
        }
        ModelConfig::new()
            .with_num_layers(70)
            .with_dilation_rate(1)
            .validate()
            .unwrap();
    }

    #[test]
    fn model_config_survives_json() {
        let config = ModelConfig::new().with_hidden_size(64).with_num_layers(4);
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
