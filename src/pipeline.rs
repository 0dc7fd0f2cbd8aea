//! Image-to-tensor pipeline shared by training and prediction.

use image::imageops::FilterType;
use thiserror::Error;

/// Per-channel normalization mean (RGB).
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel normalization standard deviation (RGB).
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Errors produced while turning image bytes into features.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Image is empty")]
    Empty,
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Converts encoded image bytes into a flat feature vector.
///
/// Implementations must be deterministic and always return `input_dim()`
/// values on success.
pub trait ImagePipeline: Send + Sync {
    fn input_dim(&self) -> usize;
    fn features(&self, bytes: &[u8]) -> Result<Vec<f32>, PipelineError>;
}

/// Square resize followed by per-channel mean/std normalization, laid out
/// channel-major (`C x H x W`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeNormalize {
    size: u32,
}

impl ResizeNormalize {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl ImagePipeline for ResizeNormalize {
    fn input_dim(&self) -> usize {
        3 * (self.size as usize) * (self.size as usize)
    }

    fn features(&self, bytes: &[u8]) -> Result<Vec<f32>, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::Empty);
        }
        let decoded = image::load_from_memory(bytes)?;
        let rgb = decoded
            .resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8();
        let plane = (self.size as usize) * (self.size as usize);
        let mut out = vec![0.0f32; 3 * plane];
        for (idx, pixel) in rgb.pixels().enumerate() {
            for channel in 0..3 {
                let value = pixel.0[channel] as f32 / 255.0;
                out[channel * plane + idx] = (value - CHANNEL_MEAN[channel]) / CHANNEL_STD[channel];
            }
        }
        Ok(out)
    }
}
