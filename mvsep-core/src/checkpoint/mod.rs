//! Versioned training checkpoints.
//!
//! A checkpoint is one safetensors file: an F32 tensor per parameter and
//! running statistic (named as in [`SeparationModel::visit`]), a U8 tensor
//! holding the serialized optimizer record, and string metadata for the
//! training counters.
//!
//! Loading merges tensors into a model by name. [`LoadMode::Strict`] requires
//! an exact match; [`LoadMode::Lenient`] keeps whatever cannot be matched and
//! reports it.

pub mod params;
pub mod tensor_store;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
};

use burn::{
    module::Module,
    prelude::Backend,
    record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use self::{
    params::{Exporter, Merger},
    tensor_store::TensorStore,
};
use crate::{config::ModelConfig, model::SeparationModel, train::LossScaler, Result};

/// Highest `format_version` this build can read.
pub const FORMAT_VERSION: u32 = 1;

const OPTIMIZER_KEY: &str = "__optimizer_state__";

mod meta {
    pub const FORMAT_VERSION: &str = "format_version";
    pub const STEP: &str = "step";
    pub const AVG_LOSS: &str = "avg_loss";
    pub const LOSS_LOG: &str = "loss_log";
    pub const PARAM_IDS: &str = "param_ids";
    pub const LOSS_SCALER: &str = "loss_scaler";
    pub const MODEL_CONFIG: &str = "model_config";
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("safetensors error: {0}")]
    Safetensors(String),

    #[error("unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("cannot read tensor {name}: {reason}")]
    Tensor { name: String, reason: String },

    #[error("missing metadata field: {0}")]
    MissingMetadata(&'static str),

    #[error("invalid metadata field {field}: {reason}")]
    InvalidMetadata { field: &'static str, reason: String },

    #[error("checkpoint format version {found} is newer than the supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("optimizer state: {0}")]
    Optimizer(String),

    #[error("checkpoint does not match the model: {0}")]
    Incompatible(LoadReport),
}

/// How to treat tensors that do not line up with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any missing, unexpected or mismatched tensor is an error.
    Strict,
    /// Matched tensors are loaded, everything else is reported and skipped.
    Lenient,
}

/// Outcome of merging a checkpoint into a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model tensors the checkpoint does not have.
    pub missing: Vec<String>,
    /// Checkpoint tensors the model does not have.
    pub unexpected: Vec<String>,
    /// Present in both but with different shapes.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} loaded", self.loaded.len())?;
        for (label, names) in [
            ("missing", &self.missing),
            ("unexpected", &self.unexpected),
            ("mismatched", &self.mismatched),
        ] {
            if !names.is_empty() {
                write!(f, "; {label}: {}", names.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Training counters carried across a resume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainingState {
    pub step: usize,
    pub avg_loss: f64,
    pub loss_log: Vec<f32>,
    pub scaler: LossScaler,
}

/// An in-memory checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model_config: ModelConfig,
    pub state: TrainingState,
    weights: TensorStore,
    param_ids: BTreeMap<String, u64>,
}

impl Checkpoint {
    /// Snapshot a model together with the training counters and the
    /// serialized optimizer record (see [`encode_record`]).
    pub fn capture<B: Backend>(
        model: &SeparationModel<B>,
        model_config: &ModelConfig,
        state: TrainingState,
        optimizer_state: Option<Vec<u8>>,
    ) -> Result<Self> {
        let mut exporter = Exporter::new();
        model.visit(&mut exporter);
        let (mut weights, param_ids) = exporter.finish()?;
        if let Some(blob) = optimizer_state {
            weights.insert_blob(OPTIMIZER_KEY, blob);
        }
        Ok(Self {
            model_config: model_config.clone(),
            state,
            weights,
            param_ids,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.weights.to_bytes(self.metadata()?)?;
        std::fs::write(path, bytes)?;
        info!(path = %path.display(), step = self.state.step, "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let checkpoint = Self::from_bytes(&bytes)?;
        info!(
            path = %path.display(),
            step = checkpoint.state.step,
            tensors = checkpoint.weights.len(),
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CheckpointError> {
        let (_, header) = safetensors::SafeTensors::read_metadata(bytes)
            .map_err(|e| CheckpointError::Safetensors(e.to_string()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let version: u32 = parse_field(&metadata, meta::FORMAT_VERSION)?;
        if version > FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let state = TrainingState {
            step: parse_field(&metadata, meta::STEP)?,
            avg_loss: parse_field(&metadata, meta::AVG_LOSS)?,
            loss_log: json_field(&metadata, meta::LOSS_LOG)?,
            scaler: json_field(&metadata, meta::LOSS_SCALER)?,
        };

        Ok(Self {
            model_config: json_field(&metadata, meta::MODEL_CONFIG)?,
            state,
            weights: TensorStore::from_bytes(bytes)?,
            param_ids: json_field(&metadata, meta::PARAM_IDS)?,
        })
    }

    /// Serialized optimizer record, if the checkpoint carries one.
    pub fn optimizer_state(&self) -> Option<&[u8]> {
        self.weights.blob(OPTIMIZER_KEY)
    }

    /// Merge the stored tensors into `model` by name.
    ///
    /// Parameter ids are restored as well so that an optimizer record saved
    /// with the checkpoint still refers to the right parameters.
    pub fn apply<B: Backend>(
        &self,
        mut model: SeparationModel<B>,
        mode: LoadMode,
    ) -> Result<(SeparationModel<B>, LoadReport)> {
        let device = model.devices().into_iter().next().unwrap_or_default();
        let mut store = self.weights.clone();
        let mut merger = Merger::<B>::new(&mut store, &self.param_ids, device);
        model.visit_mut(&mut merger);
        let report = merger.finish();

        match mode {
            LoadMode::Strict if !report.is_exact() => {
                return Err(CheckpointError::Incompatible(report).into());
            }
            LoadMode::Lenient if !report.is_exact() => {
                warn!(%report, "checkpoint only partially matches the model");
            }
            _ => info!(tensors = report.loaded.len(), "checkpoint applied"),
        }
        Ok((model, report))
    }

    fn metadata(&self) -> std::result::Result<HashMap<String, String>, CheckpointError> {
        Ok(HashMap::from([
            (meta::FORMAT_VERSION.into(), FORMAT_VERSION.to_string()),
            (meta::STEP.into(), self.state.step.to_string()),
            (meta::AVG_LOSS.into(), self.state.avg_loss.to_string()),
            (meta::LOSS_LOG.into(), to_json(meta::LOSS_LOG, &self.state.loss_log)?),
            (meta::LOSS_SCALER.into(), to_json(meta::LOSS_SCALER, &self.state.scaler)?),
            (meta::MODEL_CONFIG.into(), to_json(meta::MODEL_CONFIG, &self.model_config)?),
            (meta::PARAM_IDS.into(), to_json(meta::PARAM_IDS, &self.param_ids)?),
        ]))
    }
}

fn to_json<T: Serialize>(
    field: &'static str,
    value: &T,
) -> std::result::Result<String, CheckpointError> {
    serde_json::to_string(value).map_err(|e| CheckpointError::InvalidMetadata {
        field,
        reason: e.to_string(),
    })
}

fn raw_field<'a>(
    metadata: &'a HashMap<String, String>,
    field: &'static str,
) -> std::result::Result<&'a str, CheckpointError> {
    metadata
        .get(field)
        .map(String::as_str)
        .ok_or(CheckpointError::MissingMetadata(field))
}

fn parse_field<T>(
    metadata: &HashMap<String, String>,
    field: &'static str,
) -> std::result::Result<T, CheckpointError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw_field(metadata, field)?
        .parse()
        .map_err(|e: T::Err| CheckpointError::InvalidMetadata {
            field,
            reason: e.to_string(),
        })
}

fn json_field<T: serde::de::DeserializeOwned>(
    metadata: &HashMap<String, String>,
    field: &'static str,
) -> std::result::Result<T, CheckpointError> {
    serde_json::from_str(raw_field(metadata, field)?).map_err(|e| {
        CheckpointError::InvalidMetadata {
            field,
            reason: e.to_string(),
        }
    })
}

/// Serialize an optimizer (or any other) record to bytes at full precision.
pub fn encode_record<B: Backend, R: Record<B>>(
    record: R,
) -> std::result::Result<Vec<u8>, CheckpointError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, record, ())
        .map_err(|e| CheckpointError::Optimizer(format!("{e:?}")))
}

/// Inverse of [`encode_record`].
pub fn decode_record<B: Backend, R: Record<B>>(
    bytes: &[u8],
    device: &B::Device,
) -> std::result::Result<R, CheckpointError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::load(&recorder, bytes.to_vec(), device)
        .map_err(|e| CheckpointError::Optimizer(format!("{e:?}")))
}

#[derive(Serialize, Deserialize)]
struct LossLogFile {
    loss_log: Vec<f32>,
}

/// Write the per-step loss history as `{"loss_log": [...]}`.
pub fn write_loss_log(path: &Path, loss_log: &[f32]) -> Result<()> {
    let file = LossLogFile {
        loss_log: loss_log.to_vec(),
    };
    std::fs::write(path, to_json(meta::LOSS_LOG, &file)?)?;
    info!(path = %path.display(), steps = loss_log.len(), "loss log written");
    Ok(())
}

pub fn read_loss_log(path: &Path) -> Result<Vec<f32>> {
    let json = std::fs::read_to_string(path)?;
    let file: LossLogFile = serde_json::from_str(&json).map_err(|e| {
        CheckpointError::InvalidMetadata {
            field: meta::LOSS_LOG,
            reason: e.to_string(),
        }
    })?;
    Ok(file.loss_log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeparationError;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn config(layers: usize, hidden: usize) -> ModelConfig {
        ModelConfig::new()
            .with_hidden_size(hidden)
            .with_num_layers(layers)
            .with_reduction_ratio(4)
    }

    fn state() -> TrainingState {
        TrainingState {
            step: 42,
            avg_loss: 0.123_456_789_012_345,
            loss_log: vec![0.5, 0.25, 1.0 / 3.0],
            scaler: LossScaler::default(),
        }
    }

    fn exported(model: &SeparationModel<B>) -> TensorStore {
        let mut e = Exporter::new();
        model.visit(&mut e);
        e.finish().unwrap().0
    }

    #[test]
    fn save_load_apply_restores_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let device = Default::default();
        let cfg = config(4, 8);
        let model = cfg.init::<B>(&device);

        Checkpoint::capture(&model, &cfg, state(), Some(vec![1, 2, 3]))
            .unwrap()
            .save(&path)
            .unwrap();
        let ckpt = Checkpoint::load(&path).unwrap();

        assert_eq!(ckpt.state, state());
        assert_eq!(ckpt.model_config, cfg);
        assert_eq!(ckpt.optimizer_state(), Some(&[1u8, 2, 3][..]));

        let (restored, report) = ckpt.apply(cfg.init::<B>(&device), LoadMode::Strict).unwrap();
        assert!(report.is_exact());

        let (a, b) = (exported(&model), exported(&restored));
        for key in a.remaining_keys() {
            assert_eq!(a.get(key), b.get(key), "{key}");
        }
        assert_eq!(
            model.input.conv.weight.id,
            restored.input.conv.weight.id,
            "parameter ids must survive"
        );
    }

    #[test]
    fn lenient_merge_reports_differences() {
        let device = Default::default();
        let saved_cfg = config(4, 8);
        let saved = saved_cfg.init::<B>(&device);
        let ckpt = Checkpoint::capture(&saved, &saved_cfg, state(), None).unwrap();

        // One more block than saved: its tensors are missing.
        let (_, report) = ckpt
            .apply(config(5, 8).init::<B>(&device), LoadMode::Lenient)
            .unwrap();
        assert!(report.missing.iter().any(|n| n.starts_with("blocks.2.")));
        assert!(report.unexpected.is_empty());
        assert!(report.loaded.contains(&"magnitude_head.weight".to_string()));

        // One block fewer: the saved block is unexpected.
        let (_, report) = ckpt
            .apply(config(3, 8).init::<B>(&device), LoadMode::Lenient)
            .unwrap();
        assert!(report.unexpected.iter().any(|n| n.starts_with("blocks.1.")));

        // Wider hidden layer: shapes differ.
        let (_, report) = ckpt
            .apply(config(4, 16).init::<B>(&device), LoadMode::Lenient)
            .unwrap();
        assert!(!report.mismatched.is_empty());
    }

    #[test]
    fn strict_merge_rejects_differences() {
        let device = Default::default();
        let cfg = config(4, 8);
        let ckpt = Checkpoint::capture(&cfg.init::<B>(&device), &cfg, state(), None).unwrap();

        let result = ckpt.apply(config(5, 8).init::<B>(&device), LoadMode::Strict);
        assert!(matches!(
            result,
            Err(SeparationError::Checkpoint(CheckpointError::Incompatible(_)))
        ));
    }

    #[test]
    fn newer_format_is_rejected() {
        let device = Default::default();
        let cfg = config(3, 8);
        let ckpt = Checkpoint::capture(&cfg.init::<B>(&device), &cfg, state(), None).unwrap();
        let mut meta = ckpt.metadata().unwrap();
        meta.insert(meta::FORMAT_VERSION.into(), "2".into());
        let bytes = ckpt.weights.to_bytes(meta).unwrap();

        assert!(matches!(
            Checkpoint::from_bytes(&bytes),
            Err(CheckpointError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn missing_metadata_is_reported() {
        let device = Default::default();
        let cfg = config(3, 8);
        let ckpt = Checkpoint::capture(&cfg.init::<B>(&device), &cfg, state(), None).unwrap();
        let meta = HashMap::from([(meta::FORMAT_VERSION.to_string(), FORMAT_VERSION.to_string())]);
        let bytes = ckpt.weights.to_bytes(meta).unwrap();

        assert!(matches!(
            Checkpoint::from_bytes(&bytes),
            Err(CheckpointError::MissingMetadata(field)) if field == meta::STEP
        ));
    }

    #[test]
    fn loss_log_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loss_log.json");
        write_loss_log(&path, &[1.5, 0.75]).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("{\"loss_log\":"));
        assert_eq!(read_loss_log(&path).unwrap(), vec![1.5, 0.75]);
    }
}
