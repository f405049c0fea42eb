use ndarray::prelude::*;

use crate::config::Compartment;
use crate::errors::{MaskError, Result};

/// Channel index of the whole-cell prediction in raw model output.
pub const WHOLE_CELL_CHANNEL: usize = 0;
/// Channel index of the nuclear prediction in raw model output.
pub const NUCLEAR_CHANNEL: usize = 1;

/// Model output for a single image, `H x W x 2`.
#[derive(Debug, Clone)]
pub struct Prediction {
    channels: Array3<f32>,
}

impl Prediction {
    /// Takes the first (and only) image out of a `1 x H x W x 2` model output.
    pub fn from_batch(batch: Array4<f32>) -> Result<Self> {
        let shape = batch.shape().to_vec();
        if shape[0] != 1 || shape[3] != 2 {
            return Err(MaskError::Validation {
                field: "prediction".to_string(),
                reason: format!("has shape {shape:?}, expected [1, height, width, 2]"),
            });
        }
        Ok(Self {
            channels: batch.index_axis_move(Axis(0), 0),
        })
    }

    pub fn channel(&self, index: usize) -> ArrayView2<'_, f32> {
        self.channels.index_axis(Axis(2), index)
    }

    /// `(height, width)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.channels.len_of(Axis(0)), self.channels.len_of(Axis(1)))
    }
}

/// Reorders raw `[whole-cell, nuclear]` output so the requested compartment
/// sits at channel 0.
pub fn arrange_for_compartment(mut raw: Array4<f32>, compartment: Compartment) -> Array4<f32> {
    if compartment == Compartment::Nuclear {
        raw.invert_axis(Axis(3));
    }
    raw
}
