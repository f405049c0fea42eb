use std::path::Path;

use crate::{
    config::Compartment,
    errors::{model_error, MaskError, Result},
    prediction::arrange_for_compartment,
    traits::SegmentationModel,
};
use image::{imageops, imageops::FilterType, ImageBuffer, Luma};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

/// Mesmerの重みが学習された解像度
pub const MODEL_MPP: f64 = 0.5;

/// バックボーンの都合上、入力の高さと幅はこの倍数である必要がある
pub const PAD_MULTIPLE: usize = 64;

/// スケーリング前にこのパーセンタイルを超える輝度をチャンネル毎にクリップする
pub const CLIP_PERCENTILE: f32 = 99.9;

/// モデルの入出力チャンネル数
const MODEL_CHANNELS: usize = 2;

/// ONNXにエクスポートしたMesmerセグメンテーションモデル
///
/// 入力は `1 x H x W x 2` のNHWC（核, 膜）、出力は `1 x H x W x 2` のピクセル毎の予測（細胞全体, 核）
pub struct MesmerModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    model_mpp: f64,
}

impl MesmerModel {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        let session = SessionBuilder::new()
            .map_err(model_error("session builder initialization"))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(model_error("execution provider setup"))?
            .with_memory_pattern(true)
            .map_err(model_error("memory pattern setup"))?
            .commit_from_file(model_path)
            .map_err(|e| MaskError::Model {
                operation: format!("load model file {}", model_path.display()),
                source: e.to_string().into(),
            })?;

        let (input_name, output_name) = match (session.inputs.first(), session.outputs.first()) {
            (Some(input), Some(output)) => (input.name.clone(), output.name.clone()),
            _ => {
                return Err(MaskError::Model {
                    operation: "read model inputs and outputs".to_string(),
                    source: "model declares no input or no output".into(),
                })
            }
        };
        tracing::debug!(
            model = %model_path.display(),
            input = %input_name,
            output = %output_name,
            "loaded Mesmer model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            model_mpp: MODEL_MPP,
        })
    }

    fn run(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding
            .run(ort::inputs![
                self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())
                    .map_err(model_error("input tensor creation"))?
            ])
            .map_err(model_error("inference"))?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(model_error("output extraction"))?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    /// `H x W x 2` の画像を正規化し、モデル解像度へリサイズしてパディングする
    ///
    /// パディング済み画像とパディング前の `(height, width)` を返す
    fn preprocess(
        &self,
        image: ArrayView3<f32>,
        image_mpp: f64,
    ) -> Result<(Array3<f32>, (usize, usize))> {
        let (height, width) = (image.len_of(Axis(0)), image.len_of(Axis(1)));
        let (scaled_height, scaled_width) =
            scaled_dimensions(height, width, image_mpp / self.model_mpp);

        let mut scaled = Array3::<f32>::zeros((scaled_height, scaled_width, MODEL_CHANNELS));
        for (c, channel) in image.axis_iter(Axis(2)).enumerate() {
            let normalized = normalize_channel(channel);
            let resized = resize_channel(normalized.view(), scaled_height, scaled_width)?;
            scaled.index_axis_mut(Axis(2), c).assign(&resized);
        }

        Ok((
            pad_to_multiple(scaled, PAD_MULTIPLE),
            (scaled_height, scaled_width),
        ))
    }
}

impl SegmentationModel for MesmerModel {
    fn predict(
        &self,
        batch: ArrayView4<f32>,
        image_mpp: f64,
        compartment: Compartment,
    ) -> Result<Array4<f32>> {
        let (images, height, width, channels) = batch.dim();
        if channels != MODEL_CHANNELS || height == 0 || width == 0 {
            return Err(MaskError::Validation {
                field: "model input".to_string(),
                reason: format!(
                    "has shape {:?}, expected [batch, height, width, {MODEL_CHANNELS}]",
                    batch.shape()
                ),
            });
        }

        let mut output = Array4::<f32>::zeros((images, height, width, MODEL_CHANNELS));
        for (i, image) in batch.outer_iter().enumerate() {
            let (padded, (scaled_height, scaled_width)) = self.preprocess(image, image_mpp)?;
            tracing::debug!(
                input = ?padded.shape(),
                image_mpp,
                model_mpp = self.model_mpp,
                "running Mesmer inference"
            );

            let raw = self.run(padded.insert_axis(Axis(0)).view())?;
            if raw.len_of(Axis(3)) != MODEL_CHANNELS {
                return Err(MaskError::Validation {
                    field: "model output".to_string(),
                    reason: format!(
                        "has shape {:?}, expected {MODEL_CHANNELS} channels",
                        raw.shape()
                    ),
                });
            }

            let cropped = raw.slice(s![0, ..scaled_height, ..scaled_width, ..]);
            for (c, channel) in cropped.axis_iter(Axis(2)).enumerate() {
                let restored = resize_channel(channel, height, width)?;
                output.slice_mut(s![i, .., .., c]).assign(&restored);
            }
        }

        Ok(arrange_for_compartment(output, compartment))
    }

    fn model_mpp(&self) -> f64 {
        self.model_mpp
    }
}

/// `height x width` の画像を `scale` 倍した後のサイズ（切り捨て、最小1ピクセル）
pub fn scaled_dimensions(height: usize, width: usize, scale: f64) -> (usize, usize) {
    let scale_axis = |len: usize| ((len as f64 * scale) as usize).max(1);
    (scale_axis(height), scale_axis(width))
}

/// 隣接順位間を線形補間したパーセンタイル。`values` はソートされる
pub fn percentile(values: &mut [f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(f32::total_cmp);
    let last = values.len() - 1;
    let rank = f64::from(q / 100.0).clamp(0.0, 1.0) * last as f64;
    let lower = (rank.floor() as usize).min(last);
    let upper = (rank.ceil() as usize).min(last);
    let fraction = (rank - lower as f64) as f32;
    values[lower] + (values[upper] - values[lower]) * fraction
}

/// [`CLIP_PERCENTILE`] でクリップし `[0, 1]` に正規化
///
/// 一定値のチャンネルは全てゼロになる
pub fn normalize_channel(channel: ArrayView2<f32>) -> Array2<f32> {
    let mut values = channel.iter().copied().collect::<Vec<_>>();
    let threshold = percentile(&mut values, CLIP_PERCENTILE);
    let clipped = channel.mapv(|v| v.min(threshold));

    let (min, max) = clipped
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if max > min {
        clipped.mapv(|v| (v - min) / (max - min))
    } else {
        Array2::zeros(clipped.raw_dim())
    }
}

/// 単一チャンネルのバイリニアリサイズ
pub fn resize_channel(channel: ArrayView2<f32>, height: usize, width: usize) -> Result<Array2<f32>> {
    let (src_height, src_width) = channel.dim();
    if (src_height, src_width) == (height, width) {
        return Ok(channel.to_owned());
    }

    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(
        src_width as u32,
        src_height as u32,
        channel.iter().copied().collect(),
    )
    .ok_or_else(|| MaskError::ImageProcessing {
        path: "unknown".to_string(),
        operation: "channel buffer creation".to_string(),
        source: "sample count does not match channel dimensions".into(),
    })?;
    let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    Ok(Array2::from_shape_vec((height, width), resized.into_raw())?)
}

/// 高さと幅を `multiple` の倍数までゼロパディング
pub fn pad_to_multiple(image: Array3<f32>, multiple: usize) -> Array3<f32> {
    let (height, width, channels) = image.dim();
    let round_up = |len: usize| len.div_ceil(multiple) * multiple;
    let (padded_height, padded_width) = (round_up(height), round_up(width));
    if (padded_height, padded_width) == (height, width) {
        return image;
    }

    let mut padded = Array3::<f32>::zeros((padded_height, padded_width, channels));
    padded.slice_mut(s![..height, ..width, ..]).assign(&image);
    padded
}
