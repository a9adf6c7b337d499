pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{XrayClassifier, ModelConfig, IMAGE_SIZE, CHANNELS, check_image_size, preprocess_image, decode_and_preprocess, load_and_preprocess_image};
pub use training::{XrayDataset, XrayBatcher, XrayBatch, XrayItem, EpochMetrics, EpochReport, TrainingReport, train_model, evaluate};
pub use inference::{InferenceEngine, Prediction, load_classifier};
