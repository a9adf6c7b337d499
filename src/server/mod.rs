//! 推論HTTPサーバ
//!
//! - `POST /predict` : multipart の `file` フィールドで画像を受け取り、クラスと確率を返す
//! - `GET /health`   : 死活監視

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use burn::tensor::backend::Backend;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod routes;
pub mod state;

pub use routes::ApiError;
pub use state::ServerState;

use crate::model::ServerSettings;

/// ルーターを構築
pub fn create_app<B: Backend>(state: ServerState<B>, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/", get(routes::health_check))
        .route("/health", get(routes::health_check))
        .route("/predict", post(routes::predict::<B>))
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// サーバを起動（Ctrl+C で停止）
pub async fn start_server<B: Backend>(state: ServerState<B>, settings: &ServerSettings) -> Result<()> {
    let app = create_app(state, settings);
    let addr = settings.bind_address();

    let listener = TcpListener::bind(&addr).await?;
    info!("推論サーバを起動しました: http://{}", listener.local_addr()?);
    info!("POST http://{}/predict (multipart field: {})", addr, routes::FILE_FIELD);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("推論サーバを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("シグナル待機に失敗しました: {}", e);
        std::future::pending::<()>().await;
    }
}
