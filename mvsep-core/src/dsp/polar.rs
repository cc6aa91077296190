use burn::{prelude::Backend, tensor::TensorData, Tensor};
use realfft::num_complex::Complex;

use crate::{Result, SeparationError};

/// Complex spectrogram of shape `(channels, bins, frames)`, stored row-major
/// so that `data[(c * bins + bin) * frames + frame]` is one time-frequency bin.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSpectrogram {
    data: Vec<Complex<f32>>,
    channels: usize,
    bins: usize,
    frames: usize,
}

/// Real-valued tensor with the spectrogram layout, used for magnitudes,
/// phases and normalized magnitudes.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectral {
    data: Vec<f32>,
    channels: usize,
    bins: usize,
    frames: usize,
}

impl ComplexSpectrogram {
    /// Assemble from per-channel `[frame × bin]` STFT output.
    pub(crate) fn from_frame_major(per_channel: &[Vec<Complex<f32>>], bins: usize) -> Result<Self> {
        let channels = per_channel.len();
        let frames = per_channel.first().map_or(0, |c| c.len() / bins);
        let mut data = vec![Complex::new(0.0, 0.0); channels * bins * frames];

        for (c, spec) in per_channel.iter().enumerate() {
            if spec.len() != bins * frames {
                return Err(SeparationError::Shape(format!(
                    "channel {c} has {} bins, expected {}",
                    spec.len(),
                    bins * frames
                )));
            }
            for frame in 0..frames {
                for bin in 0..bins {
                    data[(c * bins + bin) * frames + frame] = spec[frame * bins + bin];
                }
            }
        }

        Ok(Self {
            data,
            channels,
            bins,
            frames,
        })
    }

    /// One channel back in `[frame × bin]` layout, as the inverse STFT expects.
    pub(crate) fn channel_frame_major(&self, c: usize) -> Vec<Complex<f32>> {
        let mut out = vec![Complex::new(0.0, 0.0); self.bins * self.frames];
        for bin in 0..self.bins {
            for frame in 0..self.frames {
                out[frame * self.bins + bin] = self.data[(c * self.bins + bin) * self.frames + frame];
            }
        }
        out
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.bins, self.frames]
    }

    pub fn values(&self) -> &[Complex<f32>] {
        &self.data
    }

    /// Absolute value of every bin.
    pub fn magnitude(&self) -> Spectral {
        self.map(|c| c.norm())
    }

    /// Angle of every bin, in `(-π, π]`.
    pub fn phase(&self) -> Spectral {
        self.map(|c| c.arg())
    }

    /// Split into `(magnitude, phase)`, which together are lossless.
    pub fn to_polar(&self) -> (Spectral, Spectral) {
        (self.magnitude(), self.phase())
    }

    /// Rebuild `magnitude · e^{i·phase}` bin by bin.
    ///
    /// Magnitudes are used as-is, so a negative magnitude flips the bin's sign.
    pub fn from_polar(magnitude: &Spectral, phase: &Spectral) -> Result<Self> {
        if magnitude.shape() != phase.shape() {
            return Err(SeparationError::Shape(format!(
                "magnitude {:?} and phase {:?} differ in shape",
                magnitude.shape(),
                phase.shape()
            )));
        }
        let data = magnitude
            .values()
            .iter()
            .zip(phase.values())
            .map(|(&m, &p)| Complex::from_polar(m, p))
            .collect();
        let [channels, bins, frames] = magnitude.shape();
        Ok(Self {
            data,
            channels,
            bins,
            frames,
        })
    }

    fn map(&self, f: impl Fn(&Complex<f32>) -> f32) -> Spectral {
        Spectral {
            data: self.data.iter().map(f).collect(),
            channels: self.channels,
            bins: self.bins,
            frames: self.frames,
        }
    }
}

impl Spectral {
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let [channels, bins, frames] = shape;
        if data.len() != channels * bins * frames {
            return Err(SeparationError::Shape(format!(
                "{} values do not fill shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            channels,
            bins,
            frames,
        })
    }

    pub fn zeros(shape: [usize; 3]) -> Self {
        let [channels, bins, frames] = shape;
        Self {
            data: vec![0.0; channels * bins * frames],
            channels,
            bins,
            frames,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.bins, self.frames]
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// The `bins × frames` plane of channel `c`.
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.bins * self.frames;
        &self.data[c * plane..(c + 1) * plane]
    }

    pub(crate) fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        let plane = self.bins * self.frames;
        &mut self.data[c * plane..(c + 1) * plane]
    }

    /// Element-wise `self - other`.
    pub fn sub(&self, other: &Spectral) -> Result<Spectral> {
        if self.shape() != other.shape() {
            return Err(SeparationError::Shape(format!(
                "cannot subtract {:?} from {:?}",
                other.shape(),
                self.shape()
            )));
        }
        Ok(Spectral {
            data: self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect(),
            channels: self.channels,
            bins: self.bins,
            frames: self.frames,
        })
    }

    /// Contiguous frame window `[start, start + len)`, zero-filled past the end.
    pub fn frame_window(&self, start: usize, len: usize) -> Spectral {
        let mut out = Spectral::zeros([self.channels, self.bins, len]);
        let available = self.frames.saturating_sub(start).min(len);
        for c in 0..self.channels {
            for bin in 0..self.bins {
                let src = (c * self.bins + bin) * self.frames + start;
                let dst = (c * self.bins + bin) * len;
                out.data[dst..dst + available].copy_from_slice(&self.data[src..src + available]);
            }
        }
        out
    }

    /// Convert to a tensor of shape `[channels, bins, frames]` on `device`.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.shape()), device)
    }

    /// Copy a `[channels, bins, frames]` tensor back to the host.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 3>) -> Result<Self> {
        let shape = tensor.dims();
        let data: Vec<f32> = tensor
            .into_data()
            .to_vec()
            .map_err(|e| SeparationError::Tensor(format!("{e:?}")))?;
        Spectral::new(data, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::f32::consts::PI;

    type B = NdArray<f32>;

    #[test]
    fn frame_major_reorders_to_bin_rows() {
        // 1 channel, 2 frames, 3 bins each
        let spec = vec![
            Complex::new(1.0, 0.0),
            Complex::new(2.0, 0.0),
            Complex::new(3.0, 0.0),
            Complex::new(4.0, 0.0),
            Complex::new(5.0, 0.0),
            Complex::new(6.0, 0.0),
        ];
        let s = ComplexSpectrogram::from_frame_major(&[spec.clone()], 3).unwrap();

        assert_eq!(s.shape(), [1, 3, 2]);
        let re: Vec<f32> = s.values().iter().map(|c| c.re).collect();
        // bin0: frame0, frame1 | bin1 | bin2
        assert_eq!(re, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(s.channel_frame_major(0), spec);
    }

    #[test]
    fn polar_split_is_lossless() {
        let values = vec![
            Complex::new(3.0, 4.0),
            Complex::new(-1.0, 0.5),
            Complex::new(0.0, -2.0),
            Complex::new(0.0, 0.0),
        ];
        let s = ComplexSpectrogram::from_frame_major(&[values], 2).unwrap();
        let (mag, phase) = s.to_polar();

        assert!((mag.values()[0] - 5.0).abs() < 1e-6);
        let rebuilt = ComplexSpectrogram::from_polar(&mag, &phase).unwrap();
        for (a, b) in s.values().iter().zip(rebuilt.values()) {
            assert!((a - b).norm() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn negative_magnitude_flips_sign() {
        let mag = Spectral::new(vec![-1.0], [1, 1, 1]).unwrap();
        let phase = Spectral::new(vec![PI / 2.0], [1, 1, 1]).unwrap();
        let c = ComplexSpectrogram::from_polar(&mag, &phase).unwrap().values()[0];
        assert!(c.re.abs() < 1e-6);
        assert!((c.im + 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_polar_rejects_shape_mismatch() {
        let mag = Spectral::zeros([2, 3, 4]);
        let phase = Spectral::zeros([2, 3, 5]);
        assert!(ComplexSpectrogram::from_polar(&mag, &phase).is_err());
    }

    #[test]
    fn frame_window_pads_with_zeros() {
        let s = Spectral::new((1..=6).map(|x| x as f32).collect(), [1, 2, 3]).unwrap();
        let w = s.frame_window(1, 4);
        assert_eq!(w.shape(), [1, 2, 4]);
        assert_eq!(w.values(), &[2.0, 3.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn tensor_round_trip() {
        let s = Spectral::new((0..24).map(|x| x as f32).collect(), [2, 3, 4]).unwrap();
        let t = s.to_tensor::<B>(&Default::default());
        assert_eq!(t.dims(), [2, 3, 4]);
        assert_eq!(Spectral::from_tensor(t).unwrap(), s);
    }
}
