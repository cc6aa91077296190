use std::collections::{BTreeMap, HashMap};

use burn::tensor::TensorData;
use half::{bf16, f16};
use safetensors::{serialize, tensor::TensorView, Dtype, SafeTensors};

use super::CheckpointError;

/// Owned tensor data read from (or bound for) a safetensors file.
/// Float tensors are always held as f32 regardless of the on-disk dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Named tensors of one checkpoint file.
///
/// Float tensors are taken out one by one while they are merged into a model,
/// so whatever is left afterwards was not claimed by any parameter.
#[derive(Debug, Clone, Default)]
pub struct TensorStore {
    tensors: HashMap<String, StoredTensor>,
    blobs: HashMap<String, Vec<u8>>,
}

impl TensorStore {
    /// Parse a safetensors buffer. F16/BF16 tensors are widened to f32 and
    /// U8 tensors are kept as opaque blobs.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CheckpointError> {
        let st = SafeTensors::deserialize(data)
            .map_err(|e| CheckpointError::Safetensors(e.to_string()))?;

        let mut store = TensorStore::default();
        for (name, view) in st.iter() {
            let shape: Vec<usize> = view.shape().to_vec();
            let raw = view.data();

            let values = match view.dtype() {
                Dtype::F32 => raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                Dtype::F16 => raw
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                Dtype::BF16 => raw
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                Dtype::U8 => {
                    store.blobs.insert(name.to_string(), raw.to_vec());
                    continue;
                }
                other => {
                    return Err(CheckpointError::UnsupportedDtype {
                        name: name.to_string(),
                        dtype: format!("{other:?}"),
                    })
                }
            };

            store
                .tensors
                .insert(name.to_string(), StoredTensor { data: values, shape });
        }

        Ok(store)
    }

    /// Serialize every tensor and blob as a safetensors buffer. Floats are
    /// written as little-endian F32.
    pub fn to_bytes(&self, metadata: HashMap<String, String>) -> Result<Vec<u8>, CheckpointError> {
        let float_bytes: BTreeMap<&str, Vec<u8>> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let bytes = t.data.iter().flat_map(|x| x.to_le_bytes()).collect();
                (name.as_str(), bytes)
            })
            .collect();

        let mut views = Vec::with_capacity(self.tensors.len() + self.blobs.len());
        for (name, bytes) in &float_bytes {
            let shape = self.tensors[*name].shape.clone();
            views.push((*name, view(name, Dtype::F32, shape, bytes)?));
        }
        for (name, blob) in &self.blobs {
            views.push((name.as_str(), view(name, Dtype::U8, vec![blob.len()], blob)?));
        }

        serialize(views, &Some(metadata)).map_err(|e| CheckpointError::Safetensors(e.to_string()))
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: StoredTensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn insert_blob(&mut self, key: impl Into<String>, blob: Vec<u8>) {
        self.blobs.insert(key.into(), blob);
    }

    /// Take a tensor by name, removing it from the store.
    pub fn take(&mut self, key: &str) -> Result<StoredTensor, CheckpointError> {
        self.tensors
            .remove(key)
            .ok_or_else(|| CheckpointError::MissingTensor(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&StoredTensor> {
        self.tensors.get(key)
    }

    pub fn blob(&self, key: &str) -> Option<&[u8]> {
        self.blobs.get(key).map(Vec::as_slice)
    }

    /// Number of float tensors still in the store.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Float tensors nobody has taken yet, sorted.
    pub fn remaining_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        keys.sort();
        keys
    }
}

fn view<'a>(
    name: &str,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: &'a [u8],
) -> Result<TensorView<'a>, CheckpointError> {
    TensorView::new(dtype, shape, bytes)
        .map_err(|e| CheckpointError::Safetensors(format!("{name}: {e}")))
}

/// Convert a StoredTensor into a Burn TensorData with its stored shape.
pub fn to_tensor_data(t: StoredTensor) -> TensorData {
    TensorData::new(t.data, t.shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: &[f32], shape: &[usize]) -> StoredTensor {
        StoredTensor {
            data: data.to_vec(),
            shape: shape.to_vec(),
        }
    }

    #[test]
    fn serialize_then_parse() {
        let mut store = TensorStore::default();
        store.insert("layer.weight", tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]));
        store.insert("layer.bias", tensor(&[0.1, 0.2], &[2]));
        store.insert_blob("state", vec![7, 8, 9]);

        let meta = HashMap::from([("k".to_string(), "v".to_string())]);
        let bytes = store.to_bytes(meta).unwrap();
        let mut back = TensorStore::from_bytes(&bytes).unwrap();

        assert_eq!(back.len(), 2);
        assert_eq!(back.blob("state"), Some(&[7u8, 8, 9][..]));
        let w = back.take("layer.weight").unwrap();
        assert_eq!(w.shape, vec![2, 3]);
        assert_eq!(w.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(back.remaining_keys(), vec!["layer.bias"]);
    }

    #[test]
    fn half_precision_is_widened() {
        let bytes: Vec<u8> = [0.5f32, -2.0]
            .iter()
            .flat_map(|&x| f16::from_f32(x).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![2], &bytes).unwrap();
        let file = serialize(vec![("h", view)], &None).unwrap();

        let mut store = TensorStore::from_bytes(&file).unwrap();
        assert_eq!(store.take("h").unwrap().data, vec![0.5, -2.0]);
    }

    #[test]
    fn missing_key_error() {
        let mut store = TensorStore::default();
        store.insert("x", tensor(&[1.0], &[1]));
        assert!(matches!(
            store.take("nonexistent"),
            Err(CheckpointError::MissingTensor(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(TensorStore::from_bytes(b"not a checkpoint").is_err());
    }
}
