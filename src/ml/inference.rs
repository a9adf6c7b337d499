//! モデル推論機能

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::ml::ml_model::{
    check_image_size, decode_and_preprocess, load_and_preprocess_image, ModelConfig,
    XrayClassifier, CHANNELS,
};
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};

/// 1枚の画像に対する予測結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// 予測クラス名
    #[serde(rename = "class")]
    pub class_name: String,
    /// 予測確率（%、0〜100）
    pub confidence: f64,
}

/// 保存済みファイルからモデルを復元
///
/// メタデータのクラス数と入力サイズで同じ構造のモデルを作り、重みを読み込みます。
/// 重みの形状が構造と合わないファイルはここでエラーにします（推論時まで持ち越さない）。
pub fn load_classifier<B: Backend>(
    model_path: &Path,
    device: &B::Device,
) -> Result<(XrayClassifier<B>, ModelMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(model_path)?;
    if metadata.num_classes() == 0 {
        bail!("メタデータにクラスがありません: {}", model_path.display());
    }
    check_image_size(metadata.image_size)
        .with_context(|| format!("メタデータが不正です: {}", model_path.display()))?;

    let model = ModelConfig::new(metadata.num_classes())
        .with_image_size(metadata.image_size)
        .init::<B>(device);
    let expected = model.param_shapes();

    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(model_binary, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    let model = model.load_record(record);

    let loaded = model.param_shapes();
    if loaded.len() != expected.len() {
        bail!(
            "モデル重みのパラメータ数が一致しません: {} (期待: {})",
            loaded.len(),
            expected.len()
        );
    }
    for ((name, want), (_, got)) in expected.iter().zip(&loaded) {
        if want != got {
            bail!(
                "モデル重みの形状がメタデータと一致しません: {} {:?} (期待: {:?}, {} クラス, {}x{})",
                name,
                got,
                want,
                metadata.num_classes(),
                metadata.image_size,
                metadata.image_size
            );
        }
    }

    Ok((model, metadata))
}

/// 推論エンジン
///
/// 起動時に一度だけ構築し、以降は読み取り専用で使います。
/// 複製はパラメータのテンソルを共有するため、リクエストごとに複製して使えます。
pub struct InferenceEngine<B: Backend> {
    model: XrayClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> Clone for InferenceEngine<B> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            config: self.config.clone(),
            device: self.device.clone(),
        }
    }
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_classifier::<B>(model_path.as_ref(), &device)?;
        let config = InferenceConfig::from_metadata(&metadata);

        info!(
            "推論エンジンを初期化しました: {} ({} クラス, {}x{})",
            model_path.as_ref().display(),
            config.num_classes(),
            config.image_size,
            config.image_size
        );

        Ok(Self::from_parts(model, config, device))
    }

    pub fn from_parts(model: XrayClassifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        Self {
            model,
            config,
            device,
        }
    }

    /// アップロードされたバイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let data = decode_and_preprocess(bytes, self.config.image_size)?;
        self.classify_preprocessed(data)
    }

    /// 画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let data = load_and_preprocess_image(image_path.as_ref(), self.config.image_size)?;
        self.classify_preprocessed(data)
    }

    /// 前処理済みデータ（CHW、長さ 3*S*S）を分類
    pub fn classify_preprocessed(&self, data: Vec<f32>) -> Result<Prediction> {
        let size = self.config.image_size;
        if data.len() != CHANNELS * size * size {
            bail!(
                "入力データ長が不正です: {} (期待: {})",
                data.len(),
                CHANNELS * size * size
            );
        }

        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device)
            .reshape([1, CHANNELS, size, size]);

        let output = self.model.forward(tensor);
        let probs = softmax(output, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_idx, probability) = probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| anyhow!("モデル出力が空です"))?;

        let class_name = self
            .config
            .class_index_to_label(class_idx)
            .ok_or_else(|| anyhow!("クラスインデックス {} は範囲外です", class_idx))?
            .to_string();

        Ok(Prediction {
            class_name,
            confidence: (probability as f64 * 100.0).clamp(0.0, 100.0),
        })
    }

    pub fn model(&self) -> &XrayClassifier<B> {
        &self.model
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
