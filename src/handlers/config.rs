use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Report the effective configuration.
///
/// ## Endpoint: `GET /api/v1/config`
///
/// Configuration is fixed at startup; change it through `config.toml` or
/// `APP__*` environment variables and restart.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "storage": {
                "scratch_dir": config.storage.scratch_dir,
                "output_dir": config.storage.output_dir,
                "container_extension": config.storage.container_extension
            },
            "sessions": {
                "max_concurrent_sessions": config.sessions.max_concurrent_sessions,
                "max_chunk_bytes": config.sessions.max_chunk_bytes,
                "processing_timeout_secs": config.sessions.processing_timeout_secs
            },
            "transcoder": {
                "ffmpeg_path": config.transcoder.ffmpeg_path,
                "ffmpeg_sample_rate": config.transcoder.ffmpeg_sample_rate
            },
            "pipeline": {
                "mode": config.pipeline.mode,
                "url": config.pipeline.url,
                "frame_samples": config.pipeline.frame_samples
            }
        }
    })))
}
