//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデルファイル、学習パラメータ、HTTPサーバ設定を
//! JSON形式で保存・読み込みします。

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::ml::check_image_size;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// ビルド時に利用可能なアクセラレータを優先
    #[default]
    Auto,
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "Auto"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// パラメータファイル（学習の出力先かつ推論の入力元）
    pub model_path: String,
    /// 入力画像サイズ（正方形、4の倍数）
    pub image_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/xray_tiny_cnn.tar.gz".to_string(),
            image_size: crate::ml::IMAGE_SIZE,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 学習データ（クラスごとのサブディレクトリ）
    pub train_dir: String,
    /// テストデータ（クラスごとのサブディレクトリ）
    pub test_dir: String,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合（学習フォルダから切り出す）
    pub val_ratio: f64,
    /// 学習時のデータ拡張（左右反転・小回転）
    pub augment: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            train_dir: "dataset/train".to_string(),
            test_dir: "dataset/test".to_string(),
            num_epochs: 5,
            batch_size: 8,
            num_workers: 0,
            learning_rate: 1e-3,
            seed: 42,
            val_ratio: 0.2,
            augment: true,
        }
    }
}

/// 推論サーバ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロード可能な最大バイト数
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ServerSettings {
    /// `host:port` 形式のバインドアドレス
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 推論サーバ設定
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合や壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}. デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません ({}). デフォルト設定を使用します", path.display());
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習・推論を始める前に値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        check_image_size(self.model.image_size)?;
        if self.training.batch_size == 0 {
            bail!("batch_size は1以上である必要があります");
        }
        if self.training.num_epochs == 0 {
            bail!("num_epochs は1以上である必要があります");
        }
        if !(self.training.learning_rate > 0.0) {
            bail!("learning_rate は正の値である必要があります: {}", self.training.learning_rate);
        }
        let ratio = self.training.val_ratio;
        if !(0.0..1.0).contains(&ratio) {
            bail!("val_ratio は0以上1未満である必要があります: {}", ratio);
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("モデルパス: {}", self.model.model_path);
        info!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        info!(
            "学習: epochs={}, batch_size={}, lr={}, seed={}, augment={}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed,
            self.training.augment
        );
        info!("データ: train={}, test={}", self.training.train_dir, self.training.test_dir);
        info!("サーバ: {}", self.server.bind_address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Auto);
        assert_eq!(config.model.image_size, 128);
        assert_eq!(config.training.num_epochs, 5);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.training.learning_rate, 1e-3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.model_path, deserialized.model.model_path);
        assert_eq!(config.server.port, deserialized.server.port);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "device_type": "cpu", "training": { "num_epochs": 1 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 1);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.model.image_size, 128);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.model.image_size = 30;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.val_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path().join("nope.json"));
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.server.port = 9100;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9100);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
