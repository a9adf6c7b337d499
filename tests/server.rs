use std::io::Cursor;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use tower::ServiceExt;

use xray_classifier::backend::CpuBackend;
use xray_classifier::ml::{InferenceEngine, ModelConfig};
use xray_classifier::model::{InferenceConfig, ModelMetadata, ServerSettings};
use xray_classifier::server::{create_app, ServerState};

const BOUNDARY: &str = "xray-test-boundary";

fn app_with(settings: ServerSettings) -> Router {
    let device = Default::default();
    let model = ModelConfig::new(2).with_image_size(16).init::<CpuBackend>(&device);
    let metadata = ModelMetadata::new(vec!["normal".into(), "pneumonia".into()], 16, 1);
    let engine = InferenceEngine::from_parts(model, InferenceConfig::from_metadata(&metadata), device);
    create_app(ServerState::new(engine), &settings)
}

fn app() -> Router {
    app_with(ServerSettings::default())
}

fn png_256() -> Vec<u8> {
    let img = RgbImage::from_fn(256, 256, |x, y| Rgb([x as u8, y as u8, (x ^ y) as u8]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn multipart_request(field: &str, payload: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn valid_image_returns_class_and_confidence() {
    let (status, json) = send(app(), multipart_request("file", &png_256())).await;

    assert_eq!(status, StatusCode::OK);
    let class = json["class"].as_str().unwrap();
    assert!(class == "normal" || class == "pneumonia");
    let confidence = json["confidence"].as_f64().unwrap();
    assert!((0.0..=100.0).contains(&confidence));
}

#[tokio::test]
async fn non_image_upload_is_a_500_with_error_key() {
    let app = app();
    let (status, json) = send(app.clone(), multipart_request("file", b"hello, not an image")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].is_string());

    // サービスはそのまま応答を続ける
    let (status, _) = send(app, multipart_request("file", &png_256())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn repeated_requests_are_identical() {
    let app = app();
    let image = png_256();
    let (_, first) = send(app.clone(), multipart_request("file", &image)).await;
    for _ in 0..3 {
        let (_, again) = send(app.clone(), multipart_request("file", &image)).await;
        assert_eq!(again, first);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_all_succeed() {
    let app = app();
    let image = png_256();
    let handles: Vec<_> = (0..8)
        .map(|_| tokio::spawn(send(app.clone(), multipart_request("file", &image))))
        .collect();

    let mut bodies = Vec::new();
    for handle in handles {
        let (status, json) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        bodies.push(json);
    }
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn missing_file_field_is_a_500() {
    let (status, json) = send(app(), multipart_request("image", &png_256())).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("file"));
}

#[tokio::test]
async fn non_multipart_body_is_a_500() {
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, json) = send(app(), request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn oversized_upload_is_a_500() {
    let settings = ServerSettings {
        max_upload_bytes: 1024,
        ..ServerSettings::default()
    };
    let (status, json) = send(app_with(settings), multipart_request("file", &vec![0u8; 8192])).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn health_reports_service() {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, json) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "xray_classifier");
}
