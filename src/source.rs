use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Pixel, Primitive};
use ndarray::prelude::*;
use num_traits::AsPrimitive;

use crate::errors::{MaskError, Result};

/// Minimum number of channels a source image needs for channel selection.
pub const MIN_CHANNELS: usize = 3;

/// A decoded source image as an `H x W x C` array of raw sample values.
#[derive(Debug, Clone)]
pub struct SourceImage {
    path: PathBuf,
    pixels: Array3<f32>,
}

impl SourceImage {
    /// Reads `path` from disk, keeping raw sample values (no normalization).
    ///
    /// Images with an alpha channel keep it as a fourth channel. Grayscale
    /// images are rejected because they cannot feed two model channels.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MaskError::file_not_found("Source image", path));
        }

        let image = image::open(path).map_err(|e| MaskError::ImageProcessing {
            path: path.display().to_string(),
            operation: "image decoding".to_string(),
            source: Box::new(e),
        })?;

        let pixels = match image {
            DynamicImage::ImageRgb8(buffer) => to_array(&buffer)?,
            DynamicImage::ImageRgba8(buffer) => to_array(&buffer)?,
            DynamicImage::ImageRgb16(buffer) => to_array(&buffer)?,
            DynamicImage::ImageRgba16(buffer) => to_array(&buffer)?,
            DynamicImage::ImageRgb32F(buffer) => to_array(&buffer)?,
            DynamicImage::ImageRgba32F(buffer) => to_array(&buffer)?,
            other => {
                return Err(MaskError::Validation {
                    field: format!("source image {}", path.display()),
                    reason: format!(
                        "has color type {:?}; at least {MIN_CHANNELS} channels are required",
                        other.color()
                    ),
                })
            }
        };

        tracing::debug!(
            path = %path.display(),
            shape = ?pixels.shape(),
            "loaded source image"
        );

        Ok(Self {
            path: path.to_path_buf(),
            pixels,
        })
    }

    pub fn from_array(path: impl Into<PathBuf>, pixels: Array3<f32>) -> Self {
        Self {
            path: path.into(),
            pixels,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pixels(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }

    pub fn channels(&self) -> usize {
        self.pixels.len_of(Axis(2))
    }

    /// `(height, width)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.pixels.len_of(Axis(0)), self.pixels.len_of(Axis(1)))
    }
}

fn to_array<P, S>(buffer: &ImageBuffer<P, Vec<S>>) -> Result<Array3<f32>>
where
    P: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
{
    let (width, height) = buffer.dimensions();
    let shape = (
        height as usize,
        width as usize,
        usize::from(P::CHANNEL_COUNT),
    );
    let samples = buffer.as_raw().iter().map(|v| v.as_()).collect();
    Ok(Array3::from_shape_vec(shape, samples)?)
}
