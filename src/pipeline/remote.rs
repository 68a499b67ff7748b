//! # Remote Voice Agent Binding
//!
//! Sends a waveform to an external voice agent over a WebSocket and streams back
//! its response.
//!
//! ## Exchange:
//! 1. Client sends `{"type":"input_audio","sample_rate":R,"samples":N}`
//! 2. Client sends one binary frame of little-endian 16-bit PCM
//! 3. Client sends `{"type":"input_audio_end"}`
//! 4. Agent replies with any mix of:
//!    - `{"type":"text","delta":"..."}`
//!    - `{"type":"lifecycle","event":"..."}`
//!    - `{"type":"error","message":"..."}`
//!    - binary frames of little-endian 16-bit PCM
//! 5. The exchange ends when the agent closes the socket or sends the
//!    `session_ended` lifecycle event

use super::{PipelineEvent, PipelineStream, VoicePipeline};
use crate::audio::transcoder::Waveform;
use crate::error::{AppError, AppResult};
use crate::transport::{decode_pcm_frame, encode_pcm_frame};
use async_trait::async_trait;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const SESSION_ENDED: &str = "session_ended";

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outgoing {
    InputAudio { sample_rate: u32, samples: usize },
    InputAudioEnd,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Incoming {
    Text { delta: String },
    Lifecycle { event: String },
    Error { message: String },
}

pub struct RemotePipeline {
    url: String,
}

impl RemotePipeline {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl VoicePipeline for RemotePipeline {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn stream(&self, waveform: Waveform) -> AppResult<PipelineStream> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| AppError::Pipeline(format!("connecting to voice agent at {}: {}", self.url, e)))?;
        info!(url = %self.url, "Connected to voice agent");

        let (mut write, read) = socket.split();

        let header = Outgoing::InputAudio {
            sample_rate: waveform.sample_rate,
            samples: waveform.samples.len(),
        };
        send(&mut write, Message::Text(serde_json::to_string(&header)?)).await?;
        send(&mut write, Message::Binary(encode_pcm_frame(&waveform.samples))).await?;
        send(&mut write, Message::Text(serde_json::to_string(&Outgoing::InputAudioEnd)?)).await?;

        let exchange = Exchange {
            write,
            read,
            finished: false,
        };

        Ok(stream::unfold(exchange, |mut exchange| async move {
            let event = exchange.next_event().await?;
            Some((event, exchange))
        })
        .boxed())
    }
}

async fn send(write: &mut SplitSink<AgentSocket, Message>, message: Message) -> AppResult<()> {
    write
        .send(message)
        .await
        .map_err(|e| AppError::Pipeline(format!("sending to voice agent: {}", e)))
}

/// Receiving side of one agent conversation.
struct Exchange {
    write: SplitSink<AgentSocket, Message>,
    read: SplitStream<AgentSocket>,
    finished: bool,
}

impl Exchange {
    async fn next_event(&mut self) -> Option<AppResult<PipelineEvent>> {
        if self.finished {
            return None;
        }

        loop {
            let message = match self.read.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(AppError::Pipeline(format!(
                        "receiving from voice agent: {}",
                        e
                    ))));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            };

            match message {
                Message::Text(text) => match serde_json::from_str::<Incoming>(&text) {
                    Ok(Incoming::Text { delta }) => return Some(Ok(PipelineEvent::TextDelta(delta))),
                    Ok(Incoming::Lifecycle { event }) => {
                        if event == SESSION_ENDED {
                            self.finished = true;
                            // Best effort; the agent may already be gone
                            let _ = self.write.send(Message::Close(None)).await;
                        }
                        return Some(Ok(PipelineEvent::Lifecycle(event)));
                    }
                    Ok(Incoming::Error { message }) => return Some(Ok(PipelineEvent::Error(message))),
                    Err(e) => warn!(error = %e, "Ignoring unrecognized voice agent message"),
                },
                Message::Binary(bytes) => return Some(Ok(PipelineEvent::Audio(decode_pcm_frame(&bytes)))),
                Message::Close(frame) => {
                    debug!(?frame, "Voice agent closed the connection");
                    self.finished = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one connection, check the request, and reply with `replies`.
    async fn spawn_agent(replies: Vec<Message>) -> (String, tokio::task::JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut request = Vec::new();
            for _ in 0..3 {
                request.push(socket.next().await.unwrap().unwrap());
            }
            for reply in replies {
                socket.send(reply).await.unwrap();
            }
            // Drain until the client goes away
            while let Some(Ok(_)) = socket.next().await {}
            request
        });

        (url, handle)
    }

    #[tokio::test]
    async fn test_exchange_with_agent() {
        let (url, agent) = spawn_agent(vec![
            Message::Text(r#"{"type":"lifecycle","event":"turn_started"}"#.to_string()),
            Message::Text(r#"{"type":"text","delta":"hello"}"#.to_string()),
            Message::Text(r#"{"type":"unknown"}"#.to_string()),
            Message::Binary(vec![0x64, 0x00, 0x9c, 0xff]),
            Message::Text(r#"{"type":"lifecycle","event":"session_ended"}"#.to_string()),
            Message::Text(r#"{"type":"text","delta":"never seen"}"#.to_string()),
        ])
        .await;

        let pipeline = RemotePipeline::new(url);
        let waveform = Waveform {
            samples: vec![7, -7],
            sample_rate: 16000,
        };
        let events: Vec<PipelineEvent> = pipeline
            .stream(waveform)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                PipelineEvent::Lifecycle("turn_started".to_string()),
                PipelineEvent::TextDelta("hello".to_string()),
                PipelineEvent::Audio(vec![100, -100]),
                PipelineEvent::Lifecycle("session_ended".to_string()),
            ]
        );

        let request = agent.await.unwrap();
        let header: serde_json::Value = serde_json::from_str(request[0].to_text().unwrap()).unwrap();
        assert_eq!(header["type"], "input_audio");
        assert_eq!(header["sample_rate"], 16000);
        assert_eq!(header["samples"], 2);
        assert_eq!(request[1], Message::Binary(vec![0x07, 0x00, 0xf9, 0xff]));
        assert_eq!(request[2].to_text().unwrap(), r#"{"type":"input_audio_end"}"#);
    }

    #[tokio::test]
    async fn test_stream_ends_when_agent_closes() {
        let (url, _agent) = spawn_agent(vec![
            Message::Text(r#"{"type":"error","message":"quota exceeded"}"#.to_string()),
            Message::Close(None),
        ])
        .await;

        let events: Vec<AppResult<PipelineEvent>> = RemotePipeline::new(url)
            .stream(Waveform {
                samples: vec![1],
                sample_rate: 8000,
            })
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(PipelineEvent::Error(m)) if m == "quota exceeded"));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_pipeline_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = RemotePipeline::new(url)
            .stream(Waveform {
                samples: vec![1],
                sample_rate: 8000,
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "pipeline_failure");
    }
}
