pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use scaler::LossScaler;
pub use scheduler::cosine_schedule;
pub use trainer::{separation_loss, Trainer};
