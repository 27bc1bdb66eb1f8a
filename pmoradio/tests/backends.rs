//! HTTP backends against mock servers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pmoradio::params::RawRecipe;
use pmoradio::{
    AceStepRenderer, OllamaParams, ParamsGenerator, ParamsRequest, RenderError, TrackId,
    TrackParams, TrackRenderer,
};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "llama3.2:3b";

fn chat_answer(content: &str) -> serde_json::Value {
    json!({
        "model": MODEL,
        "message": {"role": "assistant", "content": content},
        "done": true
    })
}

fn request(message: &str) -> ParamsRequest {
    ParamsRequest {
        message: message.to_string(),
        taste_context: "No preferences yet.".to_string(),
        ..ParamsRequest::default()
    }
}

fn track_params() -> TrackParams {
    let raw: RawRecipe = serde_json::from_value(json!({
        "tags": "deep house, hypnotic, synth bass, drums, instrumental",
        "bpm": 124,
        "key_scale": "G Minor",
        "instrumental": true,
        "seed": 42
    }))
    .unwrap();
    TrackParams::stamp(raw.validate(), TrackId(3), "default", "deep house")
}

fn completion(audio_url: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "",
                "audio": [{"type": "audio_url", "audio_url": {"url": audio_url}}]
            }
        }]
    })
}

#[tokio::test]
async fn test_ollama_recipe_is_validated() {
    let server = MockServer::start().await;
    let answer = r#"Here you go: {"tags": "jazz, smooth, piano, instrumental", "bpm": 400, "key_scale": "D Dorian", "time_signature": 4, "instrumental": true, "rationale": "late night"}"#;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": MODEL, "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_answer(answer)))
        .expect(1)
        .mount(&server)
        .await;

    let ollama = OllamaParams::new(&server.uri(), MODEL, Duration::from_secs(5)).unwrap();
    let recipe = ollama.generate(&request("smooth jazz")).await.unwrap();

    assert_eq!(recipe.bpm, 180);
    assert_eq!(recipe.key_scale, "A Minor");
    assert_eq!(recipe.rationale, "late night");
    assert_eq!(recipe.warnings.len(), 2, "{:?}", recipe.warnings);
}

#[tokio::test]
async fn test_ollama_garbage_falls_back_to_keywords() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_answer("I love music!")))
        .expect(3)
        .mount(&server)
        .await;

    let ollama = OllamaParams::new(&server.uri(), MODEL, Duration::from_secs(5)).unwrap();
    let recipe = ollama.generate(&request("jazz with piano")).await.unwrap();

    assert!(recipe.tags.contains("jazz"), "{}", recipe.tags);
    assert!((30..=300).contains(&recipe.bpm));
}

#[tokio::test]
async fn test_ollama_server_errors_fall_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let ollama = OllamaParams::new(&server.uri(), MODEL, Duration::from_secs(5)).unwrap();
    let recipe = ollama.generate(&request("ambient drone")).await.unwrap();
    assert!(recipe.tags.contains("ambient"), "{}", recipe.tags);
}

#[tokio::test]
async fn test_ollama_forces_requested_vocals() {
    let server = MockServer::start().await;
    let answer = r#"{"tags": "deep house, groovy, synth bass, instrumental", "bpm": 124, "key_scale": "G Minor", "instrumental": true}"#;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_answer(answer)))
        .mount(&server)
        .await;

    let ollama = OllamaParams::new(&server.uri(), MODEL, Duration::from_secs(5)).unwrap();
    let recipe = ollama
        .generate(&request("deep house with female vocals"))
        .await
        .unwrap();

    assert!(!recipe.instrumental);
    assert!(recipe.tags.ends_with("female vocal"), "{}", recipe.tags);
    assert!(!recipe.tags.contains("instrumental"));
}

#[tokio::test]
async fn test_ollama_health_requires_the_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "mistral:7b"}, {"name": MODEL}]
        })))
        .mount(&server)
        .await;

    let pulled = OllamaParams::new(&server.uri(), MODEL, Duration::from_secs(5)).unwrap();
    assert!(pulled.health().await.ok);

    let missing = OllamaParams::new(&server.uri(), "qwen2:7b", Duration::from_secs(5)).unwrap();
    let status = missing.health().await;
    assert!(!status.ok);
    assert!(status.detail.unwrap().contains("qwen2:7b"));
}

#[tokio::test]
async fn test_acestep_writes_decoded_audio() {
    let server = MockServer::start().await;
    let audio = b"ID3\x04\x00fake mp3 frames";
    let url = format!("data:audio/mpeg;base64,{}", STANDARD.encode(audio));
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "audio_config": {"duration": 90, "instrumental": true, "bpm": 124}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&url)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("tracks").join("003-deep-house.mp3");
    let renderer = AceStepRenderer::new(
        &server.uri(),
        "acemusic/acestep-v15-turbo",
        90,
        Duration::from_secs(5),
    )
    .unwrap();

    renderer
        .render(&track_params(), &destination, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), audio);
    assert!(!dir.path().join("tracks").join("003-deep-house.mp3.part").exists());
}

#[tokio::test]
async fn test_acestep_cancel_stops_slow_request_without_writing() {
    let server = MockServer::start().await;
    let url = format!("data:audio/mpeg;base64,{}", STANDARD.encode(b"ID3"));
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&url))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("003-x.mp3");
    let renderer =
        AceStepRenderer::new(&server.uri(), "m", 90, Duration::from_secs(60)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        renderer.render(&track_params(), &destination, &cancel),
    )
    .await
    .expect("cancellation is prompt")
    .unwrap_err();
    assert!(matches!(err, RenderError::Cancelled), "{err:?}");
    assert!(!destination.exists());
    assert!(!dir.path().join("003-x.mp3.part").exists());
}

#[tokio::test]
async fn test_acestep_http_error_keeps_body_excerpt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("003-x.mp3");
    let renderer =
        AceStepRenderer::new(&server.uri(), "m", 90, Duration::from_secs(5)).unwrap();

    let err = renderer
        .render(&track_params(), &destination, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        RenderError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "CUDA out of memory");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_acestep_without_audio_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "busy", "audio": []}}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("003-x.mp3");
    let renderer =
        AceStepRenderer::new(&server.uri(), "m", 90, Duration::from_secs(5)).unwrap();

    let err = renderer
        .render(&track_params(), &destination, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::Malformed(_)), "{err:?}");
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_acestep_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    let renderer =
        AceStepRenderer::new(&server.uri(), "m", 90, Duration::from_secs(5)).unwrap();
    assert!(renderer.health().await.ok);

    let down = AceStepRenderer::new("http://127.0.0.1:9", "m", 90, Duration::from_secs(5))
        .unwrap();
    assert!(!down.health().await.ok);
}
