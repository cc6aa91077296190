pub mod norm;
pub mod polar;
pub mod stft;

pub use norm::{denormalize, normalize, NormStats};
pub use polar::{ComplexSpectrogram, Spectral};
pub use stft::{analyze, synthesize, Stft};
