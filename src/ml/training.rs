//! モデル学習と評価
//!
//! クラスごとのサブディレクトリを持つ画像フォルダを読み込み、
//! 学習/検証に分割してCNNを学習し、テストセットで評価して保存します。

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::ml::ml_model::{resize_rgb, rgb_to_chw, ModelConfig, XrayClassifier, CHANNELS};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};

/// 読み込み対象の画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 9] = ["jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp"];

/// ランダム回転の最大角度（度）
pub const MAX_ROTATION_DEGREES: f32 = 10.0;

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct XrayDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ以下の画像を再帰的に収集（パス順）
fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .context(format!("ディレクトリを読み込めません: {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// クラスディレクトリ名を列挙（ソート済み）
pub fn discover_classes(data_dir: &Path) -> Result<Vec<String>> {
    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(data_dir)
        .context(format!("データディレクトリを読み込めません: {}", data_dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            let class_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Invalid directory name: {}", path.display()))?
                .to_string();
            class_names.push(class_name);
        }
    }
    class_names.sort();
    Ok(class_names)
}

impl XrayDataset {
    /// 指定された順序でディレクトリから学習データを読み込む
    ///
    /// 存在しないクラスディレクトリはスキップされます（そのクラスのサンプル0件）。
    pub fn from_directory_with_order(data_dir: &Path, class_order: &[String]) -> Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths = Vec::new();
            collect_images(&class_dir, &mut paths)?;
            samples.extend(paths.into_iter().map(|p| (p, class_id)));
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    /// ディレクトリから学習データを読み込む（クラス順はフォルダ名のソート順）
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        let class_names = discover_classes(data_dir)?;
        if class_names.is_empty() {
            bail!("クラスディレクトリが見つかりません: {}", data_dir.display());
        }

        let dataset = Self::from_directory_with_order(data_dir, &class_names)?;
        if dataset.samples.is_empty() {
            bail!("No training samples found in {}", data_dir.display());
        }

        info!(
            "{} 枚 / {} クラスを読み込みました ({})",
            dataset.samples.len(),
            class_names.len(),
            data_dir.display()
        );
        for (i, name) in class_names.iter().enumerate() {
            info!("  Class {}: {} ({} samples)", i, name, dataset.class_count(i));
        }

        Ok(dataset)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_count(&self, class_id: usize) -> usize {
        self.samples.iter().filter(|(_, id)| *id == class_id).count()
    }

    /// データセットを学習用と検証用に分割
    ///
    /// 検証サイズは `floor(val_ratio * n)`、残りが学習用。
    /// 同じシードなら同じ分割になります。
    pub fn split(self, val_ratio: f64, seed: u64) -> (Self, Self) {
        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let val_len = ((total_len as f64) * val_ratio) as usize;
        let val_samples = samples.split_off(total_len - val_len);

        let train_dataset = Self {
            samples,
            class_names: self.class_names.clone(),
        };
        let val_dataset = Self {
            samples: val_samples,
            class_names: self.class_names,
        };

        (train_dataset, val_dataset)
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct XrayItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<XrayItem> for XrayDataset {
    fn get(&self, index: usize) -> Option<XrayItem> {
        let (path, label) = self.samples.get(index)?;
        Some(XrayItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 学習時のデータ拡張: 50%で左右反転し、±10度の範囲で回転（最近傍補間、はみ出しは黒）
pub fn augment_image<R: Rng + ?Sized>(img: RgbImage, rng: &mut R) -> RgbImage {
    let img = if rng.gen_bool(0.5) {
        image::imageops::flip_horizontal(&img)
    } else {
        img
    };

    let degrees: f32 = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES);
    rotate_about_center(&img, degrees.to_radians(), Interpolation::Nearest, Rgb([0, 0, 0]))
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct XrayBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augment: bool,
}

impl<B: Backend> XrayBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, augment: bool) -> Self {
        Self {
            device,
            image_size,
            augment,
        }
    }

    fn load_item<R: Rng + ?Sized>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>> {
        let img = image::open(path)?;
        let rgb = resize_rgb(&img, self.image_size);
        let rgb = if self.augment { augment_image(rgb, rng) } else { rgb };
        Ok(rgb_to_chw(&rgb))
    }
}

impl<B: Backend> Batcher<B, XrayItem, XrayBatch<B>> for XrayBatcher<B> {
    fn batch(&self, items: Vec<XrayItem>, _device: &B::Device) -> XrayBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * CHANNELS * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);
        let mut rng = rand::thread_rng();

        for item in items {
            match self.load_item(&item.path, &mut rng) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(CHANNELS * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, CHANNELS, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        XrayBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct XrayBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// 1パス分の集計結果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    /// サンプル平均の損失
    pub loss: f64,
    /// 正解率（%）
    pub accuracy: f64,
    pub num_samples: usize,
}

#[derive(Debug, Default)]
struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl MetricAccumulator {
    fn update(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    fn finish(self) -> EpochMetrics {
        if self.total == 0 {
            return EpochMetrics::default();
        }
        EpochMetrics {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64 * 100.0,
            num_samples: self.total,
        }
    }
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predicted = logits.argmax(1).flatten::<1>(0, 1);
    predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// 勾配なしでデータセット全体を評価（パラメータは更新しない）
pub fn evaluate<B: Backend>(
    model: &XrayClassifier<B>,
    dataset: &XrayDataset,
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> EpochMetrics {
    if dataset.len() == 0 {
        return EpochMetrics::default();
    }

    let batcher = XrayBatcher::<B>::new(device.clone(), image_size, false);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(0)
        .build(dataset.clone());

    let mut acc = MetricAccumulator::default();
    for batch in dataloader.iter() {
        let n = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets);
        let loss = output.loss.into_scalar().elem::<f64>();
        let correct = count_correct(output.output, output.targets);
        acc.update(loss, correct, n);
    }
    acc.finish()
}

/// エポックごとの記録
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: EpochMetrics,
    pub valid: EpochMetrics,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub class_names: Vec<String>,
    pub epochs: Vec<EpochReport>,
    pub test: EpochMetrics,
    /// 実際に書き込んだパラメータファイル
    pub model_path: PathBuf,
}

/// モデルの重みをバイト列に変換（f32精度）
pub fn model_to_bytes<B: Backend>(model: XrayClassifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// モデル学習を実行
///
/// 学習フォルダのサブディレクトリ名（ソート順）をクラスとし、
/// 学習後にテストセットを評価して `config.model.model_path` へ上書き保存します。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let settings = &config.training;
    let image_size = config.model.image_size;

    let dataset = XrayDataset::from_directory(Path::new(&settings.train_dir))?;
    let class_names = dataset.class_names().to_vec();
    info!("Classes: {:?}", class_names);

    let test_dir = Path::new(&settings.test_dir);
    let known: BTreeSet<&String> = class_names.iter().collect();
    let unknown: Vec<String> = discover_classes(test_dir)?
        .into_iter()
        .filter(|name| !known.contains(name))
        .collect();
    if !unknown.is_empty() {
        bail!(
            "テストデータに学習データにないクラスがあります: {}",
            unknown.join(", ")
        );
    }
    let test_dataset = XrayDataset::from_directory_with_order(test_dir, &class_names)?;

    let (dataset_train, dataset_val) = dataset.split(settings.val_ratio, settings.seed);
    info!("学習データ: {} 枚", dataset_train.len());
    info!("検証データ: {} 枚", dataset_val.len());
    info!("テストデータ: {} 枚", test_dataset.len());
    if dataset_train.len() == 0 {
        bail!("学習データが見つかりません");
    }
    if dataset_val.len() == 0 {
        warn!("検証データが0枚です。検証指標は0として報告されます");
    }

    let model_config = ModelConfig::new(class_names.len()).with_image_size(image_size);
    let mut model = model_config.init::<B>(&device);
    info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}, パラメータ数: {}",
        class_names.len(),
        image_size,
        image_size,
        model.num_params()
    );

    let mut optim = AdamConfig::new().init::<B, XrayClassifier<B>>();

    let batcher_train = XrayBatcher::<B>::new(device.clone(), image_size, settings.augment);
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    );

    let mut epochs = Vec::with_capacity(settings.num_epochs);
    for epoch in 1..=settings.num_epochs {
        let mut acc = MetricAccumulator::default();

        for batch in dataloader_train.iter() {
            let n = batch.targets.dims()[0];
            let output = model.forward_classification(batch.images, batch.targets);

            let loss = output.loss.clone().into_scalar().elem::<f64>();
            let correct = count_correct(output.output.clone(), output.targets.clone());
            acc.update(loss, correct, n);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let train = acc.finish();
        let valid = evaluate(
            &model.valid(),
            &dataset_val,
            settings.batch_size,
            image_size,
            &device,
        );

        info!(
            "Epoch {}/{} | Train Loss: {:.4}, Acc: {:.2}% | Val Loss: {:.4}, Acc: {:.2}%",
            epoch,
            settings.num_epochs,
            train.loss,
            train.accuracy,
            valid.loss,
            valid.accuracy
        );
        epochs.push(EpochReport { epoch, train, valid });
    }

    let trained = model.valid();
    let test = evaluate(&trained, &test_dataset, settings.batch_size, image_size, &device);
    if test.num_samples == 0 {
        warn!("テストデータが0枚です: {}", test_dir.display());
    }
    info!("Test Accuracy: {:.2}%", test.accuracy);

    let model_binary = model_to_bytes(trained)?;
    let metadata = ModelMetadata::new(class_names.clone(), image_size, settings.num_epochs)
        .with_training_params(settings.batch_size, settings.learning_rate, settings.seed)
        .with_test_accuracy(test.accuracy);
    let model_path = save_model_with_metadata(
        Path::new(&config.model.model_path),
        &metadata,
        &model_binary,
    )?;
    info!("Model saved to {}", model_path.display());

    Ok(TrainingReport {
        class_names,
        epochs,
        test,
        model_path,
    })
}
