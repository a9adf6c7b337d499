//! 学習用バイナリ
//!
//! 引数なしで実行すると `config.json`（なければデフォルト設定）に従って
//! 学習・検証・テストを行い、モデルファイルを上書き保存します。

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use xray_classifier::backend::{resolve_device, ComputeDevice, CpuAutodiffBackend};
#[cfg(feature = "wgpu")]
use xray_classifier::backend::GpuAutodiffBackend;
use xray_classifier::logging::init_tracing;
use xray_classifier::ml::train_model;
use xray_classifier::model::AppConfig;

#[derive(Parser)]
#[command(author, version, about = "X線画像分類モデルの学習", long_about = None)]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(long, env = "XRAY_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config);
    config.display();

    let report = match resolve_device(config.device_type) {
        ComputeDevice::Cpu(device) => train_model::<CpuAutodiffBackend>(&config, device)?,
        #[cfg(feature = "wgpu")]
        ComputeDevice::Wgpu(device) => train_model::<GpuAutodiffBackend>(&config, device)?,
    };

    info!(
        "学習完了: {} エポック, テスト精度 {:.2}% -> {}",
        report.epochs.len(),
        report.test.accuracy,
        report.model_path.display()
    );
    Ok(())
}
