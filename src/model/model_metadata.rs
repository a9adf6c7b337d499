//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//! クラス名の順序は学習時のフォルダ列挙順（ソート済み）で、
//! 推論側はこの順序をそのまま使います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順）
    /// 例: ["normal", "pneumonia"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（CNNへの入力解像度、通常128x128）
    pub image_size: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    #[serde(default)]
    pub batch_size: usize,

    /// 学習率
    #[serde(default)]
    pub learning_rate: f64,

    /// 学習/検証分割に使ったシード
    #[serde(default)]
    pub seed: u64,

    /// 保存直前に測定したテスト精度（%）
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_names: Vec<String>, image_size: usize, num_epochs: usize) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            image_size,
            num_epochs,
            batch_size: 0,
            learning_rate: 0.0,
            seed: 0,
            test_accuracy: None,
            trained_at,
        }
    }

    pub fn with_training_params(mut self, batch_size: usize, learning_rate: f64, seed: u64) -> Self {
        self.batch_size = batch_size;
        self.learning_rate = learning_rate;
        self.seed = seed;
        self
    }

    pub fn with_test_accuracy(mut self, accuracy: f64) -> Self {
        self.test_accuracy = Some(accuracy);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
