use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use proctype::api::{HttpResultsApi, ResultsApi};
use proctype::capture::{CaptureArtifacts, Recording, StreamKind};
use proctype::ProctorError;

#[derive(Debug, Default)]
struct Seen {
    auth: Vec<Option<String>>,
    submitted: Vec<Value>,
    // (field name, file name, bytes)
    fields: Vec<(String, Option<String>, Vec<u8>)>,
}

type Shared = Arc<Mutex<Seen>>;

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn get_test(
    State(seen): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    seen.lock().unwrap().auth.push(bearer(&headers));
    if id == "missing" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "test": {
            "id": id,
            "title": "Home row",
            "text": "asdf jkl",
            "hasTimeLimit": true,
            "timeLimitMinutes": 2,
            "passingCriteria": "both",
            "minAccuracy": 90,
            "minSpeed": 20,
            "disableBackspace": true
        },
        "result": { "id": "r-1", "score": 80, "speed": 40, "accuracy": 95, "passed": true },
        "canAttempt": false,
        "message": "Already passed"
    })))
}

async fn submit(
    State(seen): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut seen = seen.lock().unwrap();
    seen.auth.push(bearer(&headers));
    if id == "broken" {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    seen.submitted.push(body);
    Ok(Json(json!({ "result": { "id": 17 } })))
}

async fn upload(State(seen): State<Shared>, mut multipart: Multipart) -> StatusCode {
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.unwrap().to_vec();
        seen.lock().unwrap().fields.push((name, file_name, bytes));
    }
    StatusCode::OK
}

async fn serve() -> (SocketAddr, Shared) {
    let seen = Shared::default();
    let app = Router::new()
        .route("/api/tests/:id", get(get_test))
        .route("/api/tests/:id/submit", post(submit))
        .route("/api/tests/:id/upload-recordings", post(upload))
        .with_state(Arc::clone(&seen));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn client(addr: SocketAddr) -> HttpResultsApi {
    HttpResultsApi::new(&format!("http://{addr}/api/"), Some("s3cret".into())).unwrap()
}

#[tokio::test]
async fn fetch_reads_the_full_definition_with_bearer_auth() {
    let (addr, seen) = serve().await;
    let fetched = client(addr).fetch_test("t7").await.unwrap();

    assert_eq!(fetched.test.id, "t7");
    assert_eq!(fetched.test.text, "asdf jkl");
    assert_eq!(fetched.test.time_limit_secs(), Some(120));
    assert!(fetched.test.disable_backspace);
    assert!(!fetched.can_attempt);
    assert_eq!(fetched.message.as_deref(), Some("Already passed"));
    assert_eq!(fetched.result.unwrap().id.as_deref(), Some("r-1"));
    assert_eq!(
        seen.lock().unwrap().auth,
        vec![Some("Bearer s3cret".to_string())]
    );
}

#[tokio::test]
async fn missing_test_is_unavailable() {
    let (addr, _) = serve().await;
    let err = client(addr).fetch_test("missing").await.unwrap_err();
    match err {
        ProctorError::TestUnavailable { test_id, reason } => {
            assert_eq!(test_id, "missing");
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn submit_posts_json_and_reads_numeric_id() {
    let (addr, seen) = serve().await;
    let payload = json!({ "score": 38.0, "speed": 40.0, "accuracy": 95.0, "passed": true });

    let id = client(addr).submit_result("t7", &payload).await.unwrap();
    assert_eq!(id, "17");
    assert_eq!(seen.lock().unwrap().submitted, vec![payload]);
}

#[tokio::test]
async fn server_error_on_submit_is_a_submission_failure() {
    let (addr, _) = serve().await;
    let err = client(addr)
        .submit_result("broken", &json!({ "score": 1.0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, ProctorError::SubmissionFailed(ref reason) if reason.contains("500")));
}

#[tokio::test]
async fn upload_sends_both_files_and_the_result_id() {
    let (addr, seen) = serve().await;
    let recording = |kind, data: &[u8]| Recording {
        kind,
        mime_type: "video/webm;codecs=vp9".into(),
        data: data.to_vec(),
        chunk_count: 1,
        stopped_cleanly: true,
    };
    let artifacts = CaptureArtifacts {
        screen: Some(recording(StreamKind::Display, b"screen-bytes")),
        camera: Some(recording(StreamKind::Camera, b"camera-bytes")),
    };

    client(addr)
        .upload_recordings("t7", "17", &artifacts)
        .await
        .unwrap();

    let fields = seen.lock().unwrap().fields.clone();
    assert_eq!(fields.len(), 3);
    assert_eq!(fields[0].0, "screenRecording");
    assert_eq!(fields[0].1.as_deref(), Some("screen-recording.webm"));
    assert_eq!(fields[0].2, b"screen-bytes");
    assert_eq!(fields[1].0, "cameraRecording");
    assert_eq!(fields[1].1.as_deref(), Some("camera-recording.webm"));
    assert_eq!(fields[2], ("resultId".to_string(), None, b"17".to_vec()));
}
