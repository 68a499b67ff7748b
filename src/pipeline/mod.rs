//! # Voice Pipeline Module
//!
//! The speech/agent pipeline is an external capability. This module defines the
//! boundary to it and the adapter that turns its native events into the two
//! kinds of output the push channel understands.
//!
//! ## Key Components:
//! - **VoicePipeline**: trait implemented by each binding
//! - **PipelineAdapter**: maps native events to [`OutputEvent`]s
//! - **EchoPipeline**: local loopback binding for development
//! - **RemotePipeline**: binding to a voice agent over a WebSocket

pub mod adapter; // Native event → OutputEvent mapping
pub mod echo; // Loopback binding
pub mod remote; // WebSocket client binding

pub use adapter::{OutputEvent, PipelineAdapter};

use crate::audio::transcoder::Waveform;
use crate::config::{PipelineConfig, PipelineMode};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Events as the pipeline produces them.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A fragment of the agent's text response
    TextDelta(String),
    /// Synthesized speech, mono 16-bit PCM
    Audio(Vec<i16>),
    /// Turn/session markers such as `turn_started` or `session_ended`
    Lifecycle(String),
    /// The pipeline reported a failure in-band
    Error(String),
}

pub type PipelineStream = BoxStream<'static, AppResult<PipelineEvent>>;

#[async_trait]
pub trait VoicePipeline: Send + Sync {
    /// Short name for logs and the config endpoint.
    fn name(&self) -> &'static str;

    /// Submit a waveform and receive the pipeline's events as they are produced.
    async fn stream(&self, waveform: Waveform) -> AppResult<PipelineStream>;
}

/// Build the binding selected by configuration.
pub fn build(config: &PipelineConfig) -> AppResult<Arc<dyn VoicePipeline>> {
    match config.mode {
        PipelineMode::Echo => Ok(Arc::new(echo::EchoPipeline::new(config.frame_samples))),
        PipelineMode::Remote => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| AppError::Config("pipeline.url is required in remote mode".to_string()))?;
            Ok(Arc::new(remote::RemotePipeline::new(url)))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Pipelines with scripted behavior.

    use super::*;
    use futures_util::stream::{self, StreamExt};
    use std::sync::Mutex;

    /// Replays a fixed list of events and remembers the waveforms it was given.
    pub struct ScriptedPipeline {
        script: Vec<AppResult<PipelineEvent>>,
        received: Mutex<Vec<Waveform>>,
    }

    impl ScriptedPipeline {
        pub fn new(script: Vec<AppResult<PipelineEvent>>) -> Self {
            Self {
                script,
                received: Mutex::new(Vec::new()),
            }
        }

        pub fn received(&self) -> Vec<Waveform> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoicePipeline for ScriptedPipeline {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn stream(&self, waveform: Waveform) -> AppResult<PipelineStream> {
            self.received.lock().unwrap().push(waveform);
            let script: Vec<AppResult<PipelineEvent>> = self
                .script
                .iter()
                .map(|item| match item {
                    Ok(event) => Ok(event.clone()),
                    Err(e) => Err(AppError::Pipeline(e.to_string())),
                })
                .collect();
            Ok(tokio_stream::iter(script).boxed())
        }
    }

    /// Emits its first events and then never finishes.
    pub struct HangingPipeline {
        pub before_hang: Vec<PipelineEvent>,
    }

    #[async_trait]
    impl VoicePipeline for HangingPipeline {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn stream(&self, _waveform: Waveform) -> AppResult<PipelineStream> {
            let head = tokio_stream::iter(self.before_hang.clone().into_iter().map(Ok));
            Ok(head.chain(stream::pending()).boxed())
        }
    }

    /// Panics as soon as it is invoked.
    pub struct PanickingPipeline;

    #[async_trait]
    impl VoicePipeline for PanickingPipeline {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn stream(&self, _waveform: Waveform) -> AppResult<PipelineStream> {
            panic!("pipeline exploded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_selects_binding() {
        let mut config = crate::config::AppConfig::default().pipeline;
        assert_eq!(build(&config).unwrap().name(), "echo");

        config.mode = PipelineMode::Remote;
        assert!(matches!(build(&config), Err(AppError::Config(_))));

        config.url = Some("ws://localhost:9000/voice".to_string());
        assert_eq!(build(&config).unwrap().name(), "remote");
    }
}
