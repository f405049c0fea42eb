use ndarray::prelude::*;

use crate::config::ColorOrder;
use crate::errors::{MaskError, Result};
use crate::source::{SourceImage, MIN_CHANNELS};

/// Picks the two model channels out of `source` and adds the batch axis.
///
/// The result is `1 x H x W x 2`, in the order given by
/// [`ColorOrder::channel_indices`].
pub fn select_channels(source: &SourceImage, order: ColorOrder) -> Result<Array4<f32>> {
    let channels = source.channels();
    if channels < MIN_CHANNELS {
        return Err(MaskError::Validation {
            field: format!("source image {}", source.path().display()),
            reason: format!("has {channels} channels; at least {MIN_CHANNELS} are required"),
        });
    }

    let pixels = source.pixels();
    let [first, second] = order.channel_indices();
    let stacked = ndarray::stack(
        Axis(2),
        &[
            pixels.index_axis(Axis(2), first),
            pixels.index_axis(Axis(2), second),
        ],
    )?;

    tracing::debug!(
        order = %order,
        channels = ?[first, second],
        "selected model channels"
    );

    Ok(stacked.insert_axis(Axis(0)))
}
