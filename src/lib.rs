//! 胸部X線画像（normal / pneumonia）の小型CNN分類器
//!
//! - [`ml`] : モデル定義、学習ループ、推論エンジン
//! - [`model`] : 設定ファイルとモデルファイル（重み + メタデータ）の永続化
//! - [`server`] : `POST /predict` を提供するHTTPサーバ
//! - [`backend`] : 設定値から burn バックエンドとデバイスを選択

pub mod backend;
pub mod logging;
pub mod ml;
pub mod model;
pub mod server;
