//! モデルとメタデータの永続化
//!
//! 重みとクラス一覧を1つの tar.gz にまとめ、推論側がクラス順序と入力サイズを
//! 学習時と同じに復元できるようにします。
//!
//! アーカイブの中身:
//! - metadata.json   - メタデータ（クラス名、入力サイズなど）
//! - model.bin       - モデルの重み（burnのバイナリレコード、f32精度）

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::info;

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 拡張子に関係なく `output_path` そのものへ書き込み、既存ファイルは無条件に上書きします。
/// 推論側は同じパスをそのまま読み込みます。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = output_path.to_path_buf();

    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("保存先ディレクトリを作成できません: {}", parent.display()))?;
    }

    let file = File::create(&tar_gz_path)
        .context(format!("モデルファイルを作成できません: {}", tar_gz_path.display()))?;
    let mut archive = Builder::new(GzEncoder::new(file, Compression::default()));

    append_entry(&mut archive, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut archive, MODEL_ENTRY, model_binary)?;

    // tar -> gzip の順に閉じる
    archive
        .into_inner()
        .and_then(|gz| gz.finish())
        .context(format!("モデルファイルの書き込みに失敗しました: {}", tar_gz_path.display()))?;

    info!(
        "モデルを保存しました: {} ({:.2} MB)",
        tar_gz_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(archive: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    archive
        .append_data(&mut header, name, data)
        .context(format!("{} を書き込めません", name))
}

/// アーカイブ内の既知エントリ（未知のエントリは読み飛ばす）
#[derive(Default)]
struct ArchiveEntries {
    metadata: Option<String>,
    model: Option<Vec<u8>>,
}

impl ArchiveEntries {
    fn read(tar_gz_path: &Path, want_model: bool) -> Result<Self> {
        let file = File::open(tar_gz_path)
            .context(format!("モデルファイルを開けません: {}", tar_gz_path.display()))?;
        let mut archive = Archive::new(GzDecoder::new(file));
        let mut found = Self::default();

        for entry in archive.entries().context("tar.gz の展開に失敗しました")? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            if name == METADATA_ENTRY {
                let mut json = String::new();
                entry.read_to_string(&mut json)?;
                found.metadata = Some(json);
            } else if name == MODEL_ENTRY && want_model {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                found.model = Some(bytes);
            }
            if found.metadata.is_some() && (found.model.is_some() || !want_model) {
                break;
            }
        }
        Ok(found)
    }

    fn metadata(&self) -> Result<ModelMetadata> {
        let json = self
            .metadata
            .as_deref()
            .ok_or_else(|| anyhow!("{} がアーカイブにありません", METADATA_ENTRY))?;
        ModelMetadata::from_json_string(json)
    }

    fn into_model(self) -> Result<Vec<u8>> {
        self.model
            .ok_or_else(|| anyhow!("{} がアーカイブにありません", MODEL_ENTRY))
    }
}

/// Tar.gzからモデルメタデータだけを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    ArchiveEntries::read(tar_gz_path, false)?.metadata()
}

/// Tar.gzから重みのバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    ArchiveEntries::read(tar_gz_path, true)?.into_model()
}

/// メタデータと重みを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let entries = ArchiveEntries::read(tar_gz_path, true)?;
    let metadata = entries.metadata()?;
    Ok((metadata, entries.into_model()?))
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("クラス: {}", metadata.class_names.join(", "));
    info!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    info!("学習エポック数: {}", metadata.num_epochs);
    if let Some(acc) = metadata.test_accuracy {
        info!("テスト精度: {:.2}%", acc);
    }
    info!("学習日時: {}", metadata.trained_at);
}
