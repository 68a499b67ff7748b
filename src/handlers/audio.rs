//! # Recording Endpoints
//!
//! HTTP surface of the session lifecycle.
//!
//! ## Endpoints:
//! - `POST /audio/start`: `{"client_id": "..."}` → begin a recording
//! - `POST /audio/chunk`: multipart `client_id`, optional `chunk_index`, `chunk` → append bytes
//! - `POST /audio/stop`: `{"client_id": "..."}` → finalize and process in the background
//! - `GET /audio/sessions`: live sessions
//!
//! Output produced while processing goes to the client's push channel, not to
//! these responses.

use crate::audio::StopOutcome;
use crate::error::AppError;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const MAX_CLIENT_ID_LEN: usize = 128;
const MAX_TEXT_FIELD_BYTES: usize = 1024;

#[derive(Debug, Deserialize)]
pub struct ClientRequest {
    pub client_id: String,
}

/// Normalize a client id the same way for every entry point: surrounding
/// whitespace is dropped, and the result must be non-empty and bounded.
pub fn validate_client_id(client_id: &str) -> Result<&str, AppError> {
    let client_id = client_id.trim();
    if client_id.is_empty() {
        return Err(AppError::BadRequest("client_id must not be empty".to_string()));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "client_id longer than {} bytes",
            MAX_CLIENT_ID_LEN
        )));
    }
    Ok(client_id)
}

/// Begin a recording.
///
/// ## Response:
/// ```json
/// {"status": "recording", "client_id": "c1", "session_id": "...", "file_path": "/tmp/voice-relay/<uuid>/recording.webm"}
/// ```
pub async fn start_recording(
    state: web::Data<AppState>,
    body: web::Json<ClientRequest>,
) -> Result<HttpResponse, AppError> {
    let client_id = validate_client_id(&body.client_id)?;
    let session = state.manager.start(client_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "recording",
        "client_id": session.client_id,
        "session_id": session.session_id,
        "file_path": session.container_path()
    })))
}

/// Append one chunk.
///
/// ## Request:
/// Multipart form data with fields `client_id`, `chunk` (the bytes) and an
/// optional `chunk_index`. Field order does not matter.
pub async fn upload_chunk(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let max_chunk_bytes = state.get_config().sessions.max_chunk_bytes;

    let mut client_id: Option<String> = None;
    let mut chunk_index: Option<u64> = None;
    let mut chunk: Option<Vec<u8>> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let field_name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("Missing field name".to_string()))?;

        match field_name.as_str() {
            "client_id" => client_id = Some(read_text(&mut field, "client_id").await?),
            "chunk_index" => {
                let raw = read_text(&mut field, "chunk_index").await?;
                let index = raw.trim().parse::<u64>().map_err(|_| {
                    AppError::BadRequest(format!("chunk_index '{}' is not a non-negative integer", raw))
                })?;
                chunk_index = Some(index);
            }
            "chunk" => chunk = Some(read_field(&mut field, "chunk", max_chunk_bytes).await?),
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
                read_field(&mut field, other, max_chunk_bytes).await?;
            }
        }
    }

    let client_id = client_id.ok_or_else(|| AppError::BadRequest("Missing client_id field".to_string()))?;
    let client_id = validate_client_id(&client_id)?;
    let chunk = chunk.ok_or_else(|| AppError::BadRequest("Missing chunk field".to_string()))?;

    let receipt = state.manager.append(client_id, &chunk, chunk_index).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "chunk received",
        "chunk_index": receipt.chunk_index,
        "bytes_received": receipt.bytes_received
    })))
}

/// Finalize the recording and start background processing.
///
/// ## Response:
/// `{"status": "processing", "file_path": "..."}` or `{"status": "no active recording"}`
pub async fn stop_recording(
    state: web::Data<AppState>,
    body: web::Json<ClientRequest>,
) -> Result<HttpResponse, AppError> {
    let client_id = validate_client_id(&body.client_id)?;

    match state.manager.stop(client_id).await? {
        StopOutcome::Processing {
            container_path,
            handle,
        } => {
            // Processing continues detached
            drop(handle);
            Ok(HttpResponse::Ok().json(json!({
                "status": "processing",
                "client_id": client_id,
                "file_path": container_path
            })))
        }
        StopOutcome::NothingToStop => Ok(HttpResponse::Ok().json(json!({
            "status": "no active recording",
            "client_id": client_id
        }))),
    }
}

pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.manager.registry().summaries();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    }))
}

async fn read_field(field: &mut Field, name: &str, limit: usize) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Error reading {}: {}", name, e)))?;
        if bytes.len() + chunk.len() > limit {
            return Err(AppError::BadRequest(format!(
                "{} exceeds the {} byte limit",
                name, limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text(field: &mut Field, name: &str) -> Result<String, AppError> {
    let bytes = read_field(field, name, MAX_TEXT_FIELD_BYTES).await?;
    String::from_utf8(bytes).map_err(|_| AppError::BadRequest(format!("{} is not valid UTF-8", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transcoder::testing::wav_bytes;
    use crate::state::testing::app_state;
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};
    use std::time::Duration;

    const BOUNDARY: &str = "voice-relay-test-boundary";

    fn multipart(fields: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            if *name == "chunk" {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name
                    )
                    .as_bytes(),
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
            }
            body.extend_from_slice(value);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn chunk_request(fields: &[(&str, &[u8])]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/audio/chunk")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart(fields))
    }

    macro_rules! audio_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .route("/audio/start", web::post().to(start_recording))
                    .route("/audio/chunk", web::post().to(upload_chunk))
                    .route("/audio/stop", web::post().to(stop_recording))
                    .route("/audio/sessions", web::get().to(list_sessions)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_start_then_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(app_state(dir.path(), dir.path()));
        let app = audio_app!(state);

        let req = test::TestRequest::post()
            .uri("/audio/start")
            .set_json(json!({"client_id": "c1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "recording");
        assert_eq!(body["client_id"], "c1");
        assert!(body["file_path"].as_str().unwrap().ends_with("recording.wav"));

        let req = test::TestRequest::post()
            .uri("/audio/start")
            .set_json(json!({"client_id": "c1"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "session_conflict");
    }

    #[actix_web::test]
    async fn test_empty_client_id_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(app_state(dir.path(), dir.path()));
        let app = audio_app!(state);

        let req = test::TestRequest::post()
            .uri("/audio/start")
            .set_json(json!({"client_id": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_chunk_for_unknown_client_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(app_state(dir.path(), dir.path()));
        let app = audio_app!(state);

        let req = chunk_request(&[("client_id", b"ghost"), ("chunk", b"abc")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "session_not_found");
    }

    #[actix_web::test]
    async fn test_chunk_validation() {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(app_state(dir.path(), dir.path()));
        let app = audio_app!(state);
        state.manager.start("c1").await.unwrap();

        let missing = chunk_request(&[("client_id", b"c1")]).to_request();
        assert_eq!(test::call_service(&app, missing).await.status(), StatusCode::BAD_REQUEST);

        let bad_index = chunk_request(&[("client_id", b"c1"), ("chunk_index", b"-1"), ("chunk", b"x")]).to_request();
        assert_eq!(test::call_service(&app, bad_index).await.status(), StatusCode::BAD_REQUEST);

        let last_index = chunk_request(&[
            ("client_id", b"c1"),
            ("chunk_index", b"18446744073709551615"),
            ("chunk", b"x"),
        ])
        .to_request();
        let resp = test::call_service(&app, last_index).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "bad_request");
        assert_eq!(state.manager.registry().get("c1").unwrap().summary().chunks_received, 0);

        let oversized = vec![0u8; state.get_config().sessions.max_chunk_bytes + 1];
        let too_big = chunk_request(&[("client_id", b"c1"), ("chunk", &oversized)]).to_request();
        assert_eq!(test::call_service(&app, too_big).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_full_recording_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let state = web::Data::new(app_state(dir.path(), output.path()));
        let app = audio_app!(state);

        let req = test::TestRequest::post()
            .uri("/audio/start")
            .set_json(json!({"client_id": "c1"}))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let recording = wav_bytes(&[10; 400], 1, 16000);
        let mut total = 0;
        for (index, part) in recording.chunks(300).enumerate() {
            total += part.len();
            let index = index.to_string();
            let req = chunk_request(&[
                ("chunk", part),
                ("client_id", b"c1"),
                ("chunk_index", index.as_bytes()),
            ])
            .to_request();
            let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["status"], "chunk received");
            assert_eq!(body["bytes_received"], total);
        }

        let req = test::TestRequest::get().uri("/audio/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["state"], "recording");

        let req = test::TestRequest::post()
            .uri("/audio/stop")
            .set_json(json!({"client_id": "c1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "processing");
        let file_path = body["file_path"].as_str().unwrap().to_string();
        assert_eq!(std::fs::read(&file_path).unwrap(), recording);

        for _ in 0..200 {
            if state.manager.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.manager.registry().is_empty());
        assert_eq!(state.manager.stats().sessions_completed, 1);

        let req = test::TestRequest::post()
            .uri("/audio/stop")
            .set_json(json!({"client_id": "c1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "no active recording");
    }
}
