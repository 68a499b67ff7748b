//! Loopback binding: describes the recording, then plays it back in frames.

use super::{PipelineEvent, PipelineStream, VoicePipeline};
use crate::audio::transcoder::Waveform;
use crate::error::AppResult;
use async_trait::async_trait;
use futures_util::stream::StreamExt;

pub struct EchoPipeline {
    frame_samples: usize,
}

impl EchoPipeline {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
        }
    }
}

#[async_trait]
impl VoicePipeline for EchoPipeline {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn stream(&self, waveform: Waveform) -> AppResult<PipelineStream> {
        let summary = format!(
            "Received {:.2}s of audio ({} samples at {} Hz)",
            waveform.duration_seconds(),
            waveform.samples.len(),
            waveform.sample_rate
        );

        let mut events = Vec::with_capacity(waveform.samples.len() / self.frame_samples + 3);
        events.push(PipelineEvent::Lifecycle("turn_started".to_string()));
        events.push(PipelineEvent::TextDelta(summary));
        events.extend(
            waveform
                .samples
                .chunks(self.frame_samples)
                .map(|frame| PipelineEvent::Audio(frame.to_vec())),
        );
        events.push(PipelineEvent::Lifecycle("turn_ended".to_string()));

        Ok(tokio_stream::iter(events.into_iter().map(Ok)).boxed())
    }
}
