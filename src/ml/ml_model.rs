//! 機械学習モデルの共通定義
//!
//! 胸部X線画像分類用の小さなCNNモデルと、学習・推論で共通の前処理を提供します。

use anyhow::{bail, Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use std::path::Path;
use tracing::debug;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 128;

/// 画像チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// 入力サイズが使えるか検証（2回のプーリングで割り切れる4以上の4の倍数）
pub fn check_image_size(size: usize) -> Result<()> {
    if size < 4 || size % 4 != 0 {
        bail!("image_size は4以上の4の倍数である必要があります: {}", size);
    }
    Ok(())
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形、4の倍数）
    #[config(default = 128)]
    pub image_size: usize,
}

impl ModelConfig {
    /// Flatten後の特徴次元
    ///
    /// 2回のプーリングで空間解像度は 1/4 になる。
    pub fn feature_dim(&self) -> usize {
        let pooled = self.image_size / 4;
        32 * pooled * pooled
    }

    /// モデルを初期化
    ///
    /// # Panics
    /// `image_size` が4未満の場合（特徴マップが消えるため）。
    /// 設定値やメタデータは [`check_image_size`] で事前に検証すること。
    pub fn init<B: Backend>(&self, device: &B::Device) -> XrayClassifier<B> {
        if self.image_size < 4 {
            panic!("入力サイズが小さすぎます: {} (最小4x4が必要)", self.image_size);
        }

        let d = self.feature_dim();
        debug!(
            "[Model] 入力 {}x{} -> 16x{}x{} -> 32x{}x{} -> FC {} -> 64 -> {}",
            self.image_size,
            self.image_size,
            self.image_size / 2,
            self.image_size / 2,
            self.image_size / 4,
            self.image_size / 4,
            d,
            self.num_classes
        );

        XrayClassifier {
            // 特徴抽出: 3x3 (padding 1) + ReLU + 2x2 MaxPool を2段
            conv1: Conv2dConfig::new([3, 16], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([16, 32], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            // 分類ヘッド
            fc1: LinearConfig::new(d, 64).init(device),
            fc2: LinearConfig::new(64, self.num_classes).init(device),

            activation: Relu::new(),
        }
    }
}

/// X線画像分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (3 -> 16, padding 1) + ReLU + MaxPool 2x2
/// - Conv 3x3 (16 -> 32, padding 1) + ReLU + MaxPool 2x2
/// - Flatten
/// - FC: 32 * (size/4)^2 -> 64 + ReLU
/// - FC: 64 -> num_classes
#[derive(Module, Debug)]
pub struct XrayClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 16
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 16 -> 32
    pool2: MaxPool2d,

    fc1: Linear<B>, // d -> 64
    fc2: Linear<B>, // 64 -> num_classes

    activation: Relu,
}

impl<B: Backend> XrayClassifier<B> {
    /// 学習可能パラメータの名前と形状
    ///
    /// 読み込んだ重みが構造と一致するかの確認に使う。
    pub fn param_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        let weights = [
            ("conv1.weight", self.conv1.weight.val().dims().to_vec()),
            ("conv2.weight", self.conv2.weight.val().dims().to_vec()),
            ("fc1.weight", self.fc1.weight.val().dims().to_vec()),
            ("fc2.weight", self.fc2.weight.val().dims().to_vec()),
        ];
        let biases = [
            ("conv1.bias", &self.conv1.bias),
            ("conv2.bias", &self.conv2.bias),
            ("fc1.bias", &self.fc1.bias),
            ("fc2.bias", &self.fc2.bias),
        ];

        weights
            .into_iter()
            .chain(biases.into_iter().filter_map(|(name, bias)| {
                bias.as_ref().map(|b| (name, b.val().dims().to_vec()))
            }))
            .collect()
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 順伝播と損失計算
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `targets`: ターゲットラベル [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// RGB画像を (C, H, W) 順に平坦化し、[0, 1] にスケーリング
pub fn rgb_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(CHANNELS * (width * height) as usize);

    for channel in 0..CHANNELS {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                data.push(pixel[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// RGBに変換して size x size へリサイズ
pub fn resize_rgb(img: &DynamicImage, size: usize) -> RgbImage {
    img.resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8()
}

/// 画像を前処理（リサイズ + テンソル化）
///
/// 元の解像度に関わらず、長さ `3 * size * size` のデータを返します。
pub fn preprocess_image(img: &DynamicImage, size: usize) -> Vec<f32> {
    rgb_to_chw(&resize_rgb(img, size))
}

/// バイト列をデコードして前処理
pub fn decode_and_preprocess(bytes: &[u8], size: usize) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("画像のデコードに失敗しました")?;
    Ok(preprocess_image(&img, size))
}

/// 画像ファイルを読み込んで前処理
pub fn load_and_preprocess_image(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path).context(format!("画像の読み込みに失敗しました: {}", path.display()))?;
    Ok(preprocess_image(&img, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::Rgb;

    type TestBackend = NdArray<f32>;

    #[test]
    fn preprocess_always_yields_fixed_shape() {
        for (w, h) in [(1, 1), (7, 300), (256, 256), (640, 480), (33, 17)] {
            let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 10, 30])));
            let data = preprocess_image(&img, 32);
            assert_eq!(data.len(), 3 * 32 * 32, "input {}x{}", w, h);
            assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn grayscale_is_expanded_to_three_channels() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(50, 40, image::Luma([255])));
        let data = preprocess_image(&gray, 8);
        assert_eq!(data.len(), 3 * 8 * 8);
        assert!(data.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn chw_layout_is_channel_major() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let data = rgb_to_chw(&img);
        assert_eq!(data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn decode_rejects_non_image_bytes() {
        assert!(decode_and_preprocess(b"definitely not a png", 32).is_err());
    }

    #[test]
    fn forward_produces_logits_per_sample() {
        let device = NdArrayDevice::Cpu;
        let config = ModelConfig::new(2).with_image_size(16);
        let model = config.init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 16, 16], &device);
        let logits = model.forward(images.clone());
        assert_eq!(logits.dims(), [3, 2]);

        let (predictions, _) = model.predict(images);
        assert_eq!(predictions.dims(), [3, 1]);
    }

    #[test]
    fn feature_dim_matches_two_halvings() {
        assert_eq!(ModelConfig::new(2).feature_dim(), 32 * 32 * 32);
        assert_eq!(ModelConfig::new(5).with_image_size(16).feature_dim(), 32 * 4 * 4);
    }

    #[test]
    fn param_shapes_follow_config() {
        let device = NdArrayDevice::Cpu;
        let shapes = ModelConfig::new(2)
            .with_image_size(16)
            .init::<TestBackend>(&device)
            .param_shapes();

        assert_eq!(shapes.len(), 8);
        assert!(shapes.contains(&("conv1.weight", vec![16, 3, 3, 3])));
        assert!(shapes.contains(&("fc1.weight", vec![32 * 4 * 4, 64])));
        assert!(shapes.contains(&("fc2.bias", vec![2])));

        let wider = ModelConfig::new(2)
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .param_shapes();
        assert_ne!(shapes, wider);
    }

    #[test]
    fn image_size_must_survive_two_poolings() {
        assert!(check_image_size(4).is_ok());
        assert!(check_image_size(128).is_ok());
        for size in [0, 2, 6, 130] {
            assert!(check_image_size(size).is_err());
        }
    }
}
