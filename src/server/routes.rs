//! 推論エンドポイント

use anyhow::anyhow;
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use burn::tensor::backend::Backend;
use tracing::{debug, error};

use crate::ml::Prediction;
use crate::server::state::ServerState;

/// アップロードファイルのフィールド名
pub const FILE_FIELD: &str = "file";

/// リクエスト処理中のあらゆる失敗
///
/// 画像の不正もモデル側の失敗も区別せず `500 {"error": ...}` として返す。
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("推論リクエスト失敗: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

/// multipart から `file` フィールドのバイト列を取り出す
async fn read_file_field(multipart: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            let file_name = field.file_name().map(str::to_string);
            let bytes = field.bytes().await?;
            debug!("アップロード受信: {:?} ({} bytes)", file_name, bytes.len());
            return Ok(bytes.to_vec());
        }
    }
    Err(anyhow!("multipart に '{}' フィールドがありません", FILE_FIELD).into())
}

/// POST /predict
pub async fn predict<B: Backend>(
    State(state): State<ServerState<B>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let mut multipart = multipart?;
    let bytes = read_file_field(&mut multipart).await?;

    let engine = state.engine();
    let prediction = tokio::task::spawn_blocking(move || engine.classify_bytes(&bytes)).await??;

    Ok(Json(prediction))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
