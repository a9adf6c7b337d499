//! サーバ状態

use burn::tensor::backend::Backend;
use std::sync::{Arc, Mutex};

use crate::ml::InferenceEngine;

/// リクエスト間で共有する状態
///
/// 推論エンジンは起動時に一度だけ構築し、差し替えない。
/// burn のモジュールは `Sync` ではないため共有元は Mutex に置くが、
/// ロックは複製を取る間だけで、推論自体は各リクエストの複製で並行に行う。
pub struct ServerState<B: Backend> {
    engine: Arc<Mutex<InferenceEngine<B>>>,
}

impl<B: Backend> Clone for ServerState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<B: Backend> ServerState<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// リクエスト1件分のエンジン（パラメータは共有、書き換えなし）
    pub fn engine(&self) -> InferenceEngine<B> {
        // エンジンは書き換えないので、ポイズン状態でも中身は有効
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;
    use crate::model::{InferenceConfig, ModelMetadata};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn state() -> ServerState<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(2).with_image_size(8).init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(vec!["normal".into(), "pneumonia".into()], 8, 1);
        ServerState::new(InferenceEngine::from_parts(
            model,
            InferenceConfig::from_metadata(&metadata),
            device,
        ))
    }

    #[test]
    fn engines_are_usable_at_the_same_time() {
        let state = state();
        let first = state.engine();
        let second = state.engine();

        // 1つ目を保持したまま2つ目を取得でき、それぞれ別スレッドで推論できる
        let input = vec![0.5; 3 * 8 * 8];
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|engine| {
                let input = input.clone();
                std::thread::spawn(move || engine.classify_preprocessed(input).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
    }
}
