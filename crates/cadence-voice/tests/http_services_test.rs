use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cadence_voice::wav::wav_data_len;
use cadence_voice::{
    AudioConfig, SttConfig, SttService, Synthesizer, Transcriber, TtsConfig, TtsService,
    VoiceError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorder {
    hits: Arc<AtomicUsize>,
    fields: Arc<Mutex<HashMap<String, String>>>,
    speeds: Arc<Mutex<Vec<f64>>>,
}

/// Echoes the length of the WAV payload so callers can check framing.
async fn asr(State(rec): State<Recorder>, mut multipart: Multipart) -> (StatusCode, Json<Value>) {
    rec.hits.fetch_add(1, Ordering::SeqCst);
    let mut pcm_len = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            assert_eq!(field.file_name(), Some("audio.wav"));
            let bytes = field.bytes().await.unwrap();
            pcm_len = wav_data_len(&bytes);
        } else {
            let text = field.text().await.unwrap();
            rec.fields.lock().unwrap().insert(name, text);
        }
    }
    match pcm_len {
        Some(len) => (StatusCode::OK, Json(json!({ "text": len.to_string() }))),
        None => (StatusCode::BAD_REQUEST, Json(json!({ "error": "no audio" }))),
    }
}

/// Returns two bytes of PCM per input character.
async fn tts(State(rec): State<Recorder>, Json(body): Json<Value>) -> Vec<u8> {
    rec.hits.fetch_add(1, Ordering::SeqCst);
    assert_eq!(body["response_format"], "pcm");
    assert_eq!(body["voice"], "af_heart");
    rec.speeds
        .lock()
        .unwrap()
        .push(body["speed"].as_f64().unwrap());
    vec![0u8; body["input"].as_str().unwrap().len() * 2]
}

async fn failing() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "model loading")
}

async fn spawn_mock() -> (String, Recorder) {
    let recorder = Recorder::default();
    let app = Router::new()
        .route("/asr", post(asr))
        .route("/speech", post(tts))
        .route("/down", post(failing))
        .with_state(recorder.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), recorder)
}

fn stt(base: &str, path: &str) -> SttService {
    SttService::new(
        SttConfig {
            url: format!("{base}{path}"),
            language: "en".to_string(),
            ..Default::default()
        },
        &AudioConfig::default(),
    )
    .unwrap()
}

fn tts_service(base: &str, path: &str) -> TtsService {
    TtsService::new(TtsConfig {
        url: format!("{base}{path}"),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_transcribe_round_trips_pcm_length() {
    let (base, rec) = spawn_mock().await;
    let service = stt(&base, "/asr");

    let pcm = vec![1u8; 48_000];
    let text = service.transcribe(&pcm).await.unwrap();

    assert_eq!(text, "48000");
    let fields = rec.fields.lock().unwrap();
    assert_eq!(fields.get("model").map(String::as_str), Some("whisper-1"));
    assert_eq!(fields.get("language").map(String::as_str), Some("en"));
    assert_eq!(fields.get("response_format").map(String::as_str), Some("json"));
    assert!(!fields.contains_key("prompt"));
}

#[tokio::test]
async fn test_empty_audio_never_calls_asr() {
    let (base, rec) = spawn_mock().await;
    let service = stt(&base, "/asr");

    assert_eq!(service.transcribe(&[]).await.unwrap(), "");
    assert_eq!(rec.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_oversized_audio_is_rejected_locally() {
    let (base, rec) = spawn_mock().await;
    let service = stt(&base, "/asr");
    let pcm = vec![0u8; 10 * 1024 * 1024 + 2];

    match service.transcribe(&pcm).await {
        Err(VoiceError::InputTooLarge { service, size, .. }) => {
            assert_eq!(service, "ASR");
            assert_eq!(size, pcm.len());
        }
        other => panic!("Expected size error, got {:?}", other),
    }
    assert_eq!(rec.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_asr_error_status_is_reported() {
    let (base, _rec) = spawn_mock().await;
    let service = stt(&base, "/down");

    match service.transcribe(&[0u8; 64]).await {
        Err(VoiceError::Stt(msg)) => {
            assert!(msg.contains("status 503"), "unexpected message: {msg}");
            assert!(msg.contains("model loading"));
        }
        other => panic!("Expected Stt error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_synthesize_returns_raw_pcm() {
    let (base, rec) = spawn_mock().await;
    let service = tts_service(&base, "/speech");

    let audio = service.synthesize("Hello there.", 1.25).await.unwrap();

    assert_eq!(audio.len(), "Hello there.".len() * 2);
    assert_eq!(service.sample_rate(), 24_000);
    assert_eq!(*rec.speeds.lock().unwrap(), vec![1.25]);
}

#[tokio::test]
async fn test_non_positive_speed_sent_as_default() {
    let (base, rec) = spawn_mock().await;
    let service = tts_service(&base, "/speech");

    service.synthesize("Hi.", 0.0).await.unwrap();
    service.synthesize("Hi.", -3.0).await.unwrap();

    assert_eq!(*rec.speeds.lock().unwrap(), vec![1.0, 1.0]);
}

#[tokio::test]
async fn test_empty_text_never_calls_tts() {
    let (base, rec) = spawn_mock().await;
    let service = tts_service(&base, "/speech");

    assert!(service.synthesize("", 1.0).await.unwrap().is_empty());
    assert_eq!(rec.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tts_error_status_is_reported() {
    let (base, _rec) = spawn_mock().await;
    let service = tts_service(&base, "/down");

    match service.synthesize("Hello", 1.0).await {
        Err(VoiceError::Tts(msg)) => assert!(msg.contains("status 503")),
        other => panic!("Expected Tts error, got {:?}", other),
    }
}
