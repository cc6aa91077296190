//! Instrumental extraction from stereo music.
//!
//! A convolutional network estimates the magnitude spectrogram of the vocal
//! source from a normalized mixture; inference subtracts that estimate and
//! resynthesizes the remainder with the mixture's phase, chunk by chunk.

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dsp;
pub mod error;
pub mod inference;
pub mod listener;
pub mod model;
pub mod train;

pub use error::{Result, SeparationError};

/// Every stage works on stereo signals.
pub const AUDIO_CHANNELS: usize = 2;
