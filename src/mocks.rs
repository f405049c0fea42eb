use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Compartment;
use crate::errors::{MaskError, Result};
use crate::prediction::arrange_for_compartment;
use crate::traits::SegmentationModel;
use ndarray::prelude::*;

/// テスト用のモックセグメンテーションモデル
///
/// 全ピクセルに同じ細胞全体・核の値を返し、呼び出し回数を数える
#[derive(Debug, Default)]
pub struct MockSegmentationModel {
    pub whole_cell: f32,
    pub nuclear: f32,
    calls: AtomicUsize,
}

impl MockSegmentationModel {
    pub const fn new(whole_cell: f32, nuclear: f32) -> Self {
        Self {
            whole_cell,
            nuclear,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn predict(
        &self,
        batch: ArrayView4<f32>,
        _image_mpp: f64,
        compartment: Compartment,
    ) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (images, height, width, channels) = batch.dim();
        if channels != 2 {
            return Err(MaskError::Validation {
                field: "model input".to_string(),
                reason: format!("has {channels} channels, expected 2"),
            });
        }
        let raw = Array4::from_shape_fn((images, height, width, 2), |(_, _, _, c)| {
            if c == 0 {
                self.whole_cell
            } else {
                self.nuclear
            }
        });
        Ok(arrange_for_compartment(raw, compartment))
    }

    fn model_mpp(&self) -> f64 {
        crate::model::MODEL_MPP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_model_predict() -> Result<()> {
        let mock = MockSegmentationModel::new(1.0, 0.5);
        let input = Array4::<f32>::zeros((1, 8, 6, 2));

        let result = mock.predict(input.view(), 0.5, Compartment::Both)?;
        assert_eq!(result.shape(), &[1, 8, 6, 2]);
        assert_eq!(result[[0, 7, 5, 0]], 1.0);
        assert_eq!(result[[0, 7, 5, 1]], 0.5);
        assert_eq!(mock.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_mock_model_nuclear_first() -> Result<()> {
        let mock = MockSegmentationModel::new(1.0, 0.5);
        let input = Array4::<f32>::zeros((1, 2, 2, 2));

        let result = mock.predict(input.view(), 0.5, Compartment::Nuclear)?;
        assert_eq!(result[[0, 0, 0, 0]], 0.5);
        Ok(())
    }

    #[test]
    fn test_mock_model_rejects_wrong_channels() {
        let mock = MockSegmentationModel::default();
        let input = Array4::<f32>::zeros((1, 2, 2, 3));
        assert!(mock.predict(input.view(), 0.5, Compartment::Both).is_err());
        assert_eq!(mock.calls(), 1);
    }
}
