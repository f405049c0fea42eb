use crate::config::Compartment;
use crate::errors::Result;
use ndarray::prelude::*;

/// Mesmer系セグメンテーションモデルの抽象化
///
/// マスク生成はONNXセッションではなくこのトレイトに依存する（テストではモックを使う）
pub trait SegmentationModel: Send + Sync {
    /// `1 x H x W x 2` のバッチに対して推論を実行
    ///
    /// 戻り値は `1 x H x W x 2`。インデックス0が細胞全体、1が核。
    /// [`Compartment::Nuclear`] の場合のみ核チャンネルが先頭になる
    /// （[`crate::prediction::arrange_for_compartment`] を参照）
    fn predict(
        &self,
        batch: ArrayView4<f32>,
        image_mpp: f64,
        compartment: Compartment,
    ) -> Result<Array4<f32>>;

    /// 学習時の解像度（ミクロン/ピクセル）
    fn model_mpp(&self) -> f64;
}
