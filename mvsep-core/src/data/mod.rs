pub mod loader;
pub mod segmenter;

pub use loader::{Batch, BatchLoader, EpochBatches};
pub use segmenter::{Sample, TrackDataset};
