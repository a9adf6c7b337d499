//! ログ初期化

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` が未設定なら info レベルで標準出力へ
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
