//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータから推論に必要な情報を取り出します。

use tracing::info;

use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラス名（学習時のインデックス順）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub image_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            image_size: metadata.image_size,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        info!("=== 推論設定 ===");
        info!("クラス ({}個): {}", self.num_classes(), self.class_names.join(", "));
        info!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
    }
}
