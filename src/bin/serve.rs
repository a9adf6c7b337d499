//! 推論サーバ用バイナリ
//!
//! 起動時にモデルファイルを1度だけ読み込み、`POST /predict` で待ち受けます。
//! モデルファイルが無い・壊れている場合は起動に失敗します。

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use std::path::{Path, PathBuf};

use xray_classifier::backend::{resolve_device, ComputeDevice, CpuBackend};
#[cfg(feature = "wgpu")]
use xray_classifier::backend::GpuBackend;
use xray_classifier::logging::init_tracing;
use xray_classifier::ml::InferenceEngine;
use xray_classifier::model::{load_metadata, print_metadata_info, AppConfig};
use xray_classifier::server::{start_server, ServerState};

#[derive(Parser)]
#[command(author, version, about = "X線画像分類の推論サーバ", long_about = None)]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(long, env = "XRAY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// モデルファイル（設定値を上書き）
    #[arg(long)]
    model: Option<String>,

    /// 待ち受けポート（設定値を上書き）
    #[arg(long)]
    port: Option<u16>,
}

async fn serve<B: Backend>(config: &AppConfig, device: B::Device) -> Result<()> {
    let model_path = Path::new(&config.model.model_path);
    let metadata = load_metadata(model_path)
        .context(format!("モデルファイルを読み込めません: {}", model_path.display()))?;
    print_metadata_info(&metadata);

    let engine = InferenceEngine::<B>::load(model_path, device)?;
    engine.config().print_info();

    start_server(ServerState::new(engine), &config.server).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(model) = cli.model {
        config.model.model_path = model;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.display();

    match resolve_device(config.device_type) {
        ComputeDevice::Cpu(device) => serve::<CpuBackend>(&config, device).await,
        #[cfg(feature = "wgpu")]
        ComputeDevice::Wgpu(device) => serve::<GpuBackend>(&config, device).await,
    }
}
