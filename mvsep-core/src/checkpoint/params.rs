//! Moving model tensors in and out of a [`TensorStore`] by name.

use std::collections::BTreeMap;

use burn::{
    module::{Param, ParamId, RunningState},
    prelude::Backend,
    Tensor,
};

use super::{
    tensor_store::{to_tensor_data, StoredTensor, TensorStore},
    CheckpointError, LoadReport,
};
use crate::model::{ParamVisitor, ParamVisitorMut};

/// Copies every parameter and running statistic into a store, recording the
/// parameter ids the optimizer state is keyed by.
pub(crate) struct Exporter {
    pub(crate) store: TensorStore,
    pub(crate) param_ids: BTreeMap<String, u64>,
    error: Option<CheckpointError>,
}

impl Exporter {
    pub(crate) fn new() -> Self {
        Self {
            store: TensorStore::default(),
            param_ids: BTreeMap::new(),
            error: None,
        }
    }

    pub(crate) fn finish(self) -> Result<(TensorStore, BTreeMap<String, u64>), CheckpointError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.store, self.param_ids)),
        }
    }

    fn export<B: Backend, const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) {
        let shape = tensor.dims().to_vec();
        match tensor.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(data) => self.store.insert(name, StoredTensor { data, shape }),
            Err(e) => {
                self.error.get_or_insert(CheckpointError::Tensor {
                    name: name.to_string(),
                    reason: format!("{e:?}"),
                });
            }
        }
    }
}

impl<B: Backend> ParamVisitor<B> for Exporter {
    fn visit_param<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        self.param_ids.insert(name.to_string(), param.id.val());
        self.export(name, param.val());
    }

    fn visit_running(&mut self, name: &str, state: &RunningState<Tensor<B, 1>>) {
        self.export(name, state.value());
    }
}

/// Replaces model tensors with the stored ones of the same name and shape.
///
/// Tensors that are absent or shaped differently keep their current value and
/// are listed in the report; the caller decides whether that is fatal.
pub(crate) struct Merger<'a, B: Backend> {
    store: &'a mut TensorStore,
    param_ids: &'a BTreeMap<String, u64>,
    device: B::Device,
    pub(crate) report: LoadReport,
}

impl<'a, B: Backend> Merger<'a, B> {
    pub(crate) fn new(
        store: &'a mut TensorStore,
        param_ids: &'a BTreeMap<String, u64>,
        device: B::Device,
    ) -> Self {
        Self {
            store,
            param_ids,
            device,
            report: LoadReport::default(),
        }
    }

    fn claim<const D: usize>(&mut self, name: &str, expected: [usize; D]) -> Option<Tensor<B, D>> {
        let stored = match self.store.take(name) {
            Ok(t) => t,
            Err(_) => {
                self.report.missing.push(name.to_string());
                return None;
            }
        };
        if stored.shape != expected {
            self.report.mismatched.push(format!(
                "{name} (checkpoint {:?}, model {expected:?})",
                stored.shape
            ));
            return None;
        }
        self.report.loaded.push(name.to_string());
        Some(Tensor::from_data(to_tensor_data(stored), &self.device))
    }

    /// Whatever nobody claimed is reported as unexpected.
    pub(crate) fn finish(mut self) -> LoadReport {
        self.report.unexpected = self
            .store
            .remaining_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.report
    }
}

impl<B: Backend> ParamVisitorMut<B> for Merger<'_, B> {
    fn visit_param<const D: usize>(&mut self, name: &str, param: &mut Param<Tensor<B, D>>) {
        if let Some(tensor) = self.claim(name, param.val().dims()) {
            let id = self
                .param_ids
                .get(name)
                .map(|&id| ParamId::from(id))
                .unwrap_or_else(|| param.id.clone());
            *param = Param::initialized(id, tensor.require_grad());
        }
    }

    fn visit_running(&mut self, name: &str, state: &mut RunningState<Tensor<B, 1>>) {
        if let Some(tensor) = self.claim(name, state.value().dims()) {
            *state = RunningState::new(tensor);
        }
    }
}
