//! # Configuration Management
//!
//! Loads the application configuration from several layered sources:
//! - Default values (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP__` prefix (double underscore separates
//!   sections from keys, e.g. `APP__SESSIONS__MAX_CHUNK_BYTES=1048576`)
//!
//! `HOST` and `PORT` are also honored because most deployment platforms set them.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP__*` environment variables
//! 3. `config.toml`
//! 4. Built-in defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
    pub transcoder: TranscoderConfig,
    pub pipeline: PipelineConfig,
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Filesystem layout for recordings.
///
/// ## Fields:
/// - `scratch_dir`: root under which every session gets its own throwaway directory
/// - `output_dir`: durable directory that receives finalized containers
/// - `container_extension`: extension used for container files (browsers record `webm`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub container_extension: String,
}

/// Limits applied to recording sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Registry capacity; `start` is rejected once this many sessions are live
    pub max_concurrent_sessions: usize,

    /// Largest single chunk accepted by `/audio/chunk`
    pub max_chunk_bytes: usize,

    /// Deadline for transcode + pipeline + streaming, 0 disables it
    pub processing_timeout_secs: u64,
}

/// Container decoding.
///
/// Containers symphonia cannot handle (Opus in webm/ogg, which is what Chrome and
/// Firefox record) are decoded by an `ffmpeg` child process instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// `ffmpeg` executable, looked up on `PATH` unless absolute
    pub ffmpeg_path: PathBuf,

    /// Output rate for ffmpeg-decoded recordings
    pub ffmpeg_sample_rate: u32,
}

/// Which voice pipeline binding to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Local loopback: reports what was heard and plays it back
    Echo,
    /// External voice agent reached over a WebSocket
    Remote,
}

/// Voice pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub mode: PipelineMode,

    /// WebSocket URL of the remote voice agent (`ws://` or `wss://`)
    pub url: Option<String>,

    /// Samples per audio frame produced by the echo binding
    pub frame_samples: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            storage: StorageConfig {
                scratch_dir: env::temp_dir().join("voice-relay"),
                output_dir: PathBuf::from("recordings"),
                container_extension: "webm".to_string(),
            },
            sessions: SessionConfig {
                max_concurrent_sessions: 64,
                max_chunk_bytes: 4 * 1024 * 1024,
                processing_timeout_secs: 300,
            },
            transcoder: TranscoderConfig {
                ffmpeg_path: PathBuf::from("ffmpeg"),
                ffmpeg_sample_rate: 16000,
            },
            pipeline: PipelineConfig {
                mode: PipelineMode::Echo,
                url: None,
                frame_samples: 4800, // 300ms at 16kHz
            },
        }
    }
}

impl SessionConfig {
    /// The processing deadline, or `None` when disabled.
    pub fn processing_timeout(&self) -> Option<Duration> {
        (self.processing_timeout_secs > 0).then(|| Duration::from_secs(self.processing_timeout_secs))
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limits are non-zero
    /// - The container extension is a bare extension (no dots or separators)
    /// - The ffmpeg fallback has an executable and a sample rate
    /// - Remote mode has a `ws://` / `wss://` URL
    /// - Echo frames are non-empty
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.sessions.max_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Max chunk size must be greater than 0"));
        }

        let ext = &self.storage.container_extension;
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(anyhow::anyhow!("Invalid container extension '{}'", ext));
        }

        if self.transcoder.ffmpeg_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("transcoder.ffmpeg_path cannot be empty"));
        }

        if self.transcoder.ffmpeg_sample_rate == 0 {
            return Err(anyhow::anyhow!("ffmpeg sample rate must be greater than 0"));
        }

        if self.pipeline.mode == PipelineMode::Remote {
            match self.pipeline.url.as_deref() {
                Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {}
                Some(url) => {
                    return Err(anyhow::anyhow!(
                        "Remote pipeline URL must use ws:// or wss://, got '{}'",
                        url
                    ))
                }
                None => return Err(anyhow::anyhow!("Remote pipeline mode requires pipeline.url")),
            }
        }

        if self.pipeline.frame_samples == 0 {
            return Err(anyhow::anyhow!("Pipeline frame size must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.pipeline.mode, PipelineMode::Echo);
        assert_eq!(
            config.sessions.processing_timeout(),
            Some(Duration::from_secs(300))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.container_extension = "../webm".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.max_chunk_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcoder.ffmpeg_sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_mode_requires_websocket_url() {
        let mut config = AppConfig::default();
        config.pipeline.mode = PipelineMode::Remote;
        assert!(config.validate().is_err());

        config.pipeline.url = Some("http://agent.local/voice".to_string());
        assert!(config.validate().is_err());

        config.pipeline.url = Some("ws://agent.local/voice".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let mut config = AppConfig::default();
        config.sessions.processing_timeout_secs = 0;
        assert_eq!(config.sessions.processing_timeout(), None);
    }
}
