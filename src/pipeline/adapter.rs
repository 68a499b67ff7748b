//! # Pipeline Adapter
//!
//! Narrows a [`VoicePipeline`]'s native events to what gets pushed to clients.
//!
//! ## Mapping:
//! - `TextDelta` → [`OutputEvent::Text`]
//! - `Audio` → [`OutputEvent::AudioFrame`]
//! - `Lifecycle` → logged, not forwarded
//! - `Error`, or any error from the binding → [`AppError::Pipeline`]
//!
//! Content is never altered. The returned stream is lazy and single-pass; events
//! come out in the order the pipeline produced them.

use super::{PipelineEvent, VoicePipeline};
use crate::audio::transcoder::Waveform;
use crate::error::{AppError, AppResult};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// One unit of output for the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Text(String),
    AudioFrame(Vec<i16>),
}

pub type OutputStream = BoxStream<'static, AppResult<OutputEvent>>;

#[derive(Clone)]
pub struct PipelineAdapter {
    pipeline: Arc<dyn VoicePipeline>,
}

impl PipelineAdapter {
    pub fn new(pipeline: Arc<dyn VoicePipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline_name(&self) -> &'static str {
        self.pipeline.name()
    }

    /// Submit `waveform` and return the mapped output stream.
    pub async fn run(&self, waveform: Waveform) -> AppResult<OutputStream> {
        debug!(
            pipeline = self.pipeline.name(),
            samples = waveform.samples.len(),
            sample_rate = waveform.sample_rate,
            "Invoking voice pipeline"
        );

        let events = self.pipeline.stream(waveform).await.map_err(as_pipeline_failure)?;
        Ok(events
            .filter_map(|item| future::ready(map_event(item)))
            .boxed())
    }
}

fn map_event(item: AppResult<PipelineEvent>) -> Option<AppResult<OutputEvent>> {
    match item {
        Ok(PipelineEvent::TextDelta(text)) => Some(Ok(OutputEvent::Text(text))),
        Ok(PipelineEvent::Audio(samples)) => Some(Ok(OutputEvent::AudioFrame(samples))),
        Ok(PipelineEvent::Lifecycle(marker)) => {
            debug!(marker = %marker, "Pipeline lifecycle event");
            None
        }
        Ok(PipelineEvent::Error(message)) => Some(Err(AppError::Pipeline(message))),
        Err(e) => Some(Err(as_pipeline_failure(e))),
    }
}

fn as_pipeline_failure(error: AppError) -> AppError {
    match error {
        AppError::Pipeline(_) => error,
        other => AppError::Pipeline(other.to_string()),
    }
}
