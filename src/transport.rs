//! # Push Channel Abstraction
//!
//! A [`Transport`] is a live, server-to-client channel for one client. Processing
//! tasks only ever see this trait; the WebSocket actor in `websocket.rs` is the
//! production implementation.
//!
//! ## Wire Format:
//! - **Text**: UTF-8 fragments, sent as-is
//! - **Audio**: raw little-endian signed 16-bit PCM, one binary frame per event

use crate::error::AppResult;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Push a text fragment.
    async fn send_text(&self, text: &str) -> AppResult<()>;

    /// Push one frame of PCM samples.
    async fn send_frame(&self, samples: &[i16]) -> AppResult<()>;

    /// Whether the peer is still reachable.
    fn is_alive(&self) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Encode samples as little-endian 16-bit PCM.
pub fn encode_pcm_frame(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Decode little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn decode_pcm_frame(bytes: &[u8]) -> Vec<i16> {
    let usable = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; usable / 2];
    LittleEndian::read_i16_into(&bytes[..usable], &mut samples);
    samples
}
