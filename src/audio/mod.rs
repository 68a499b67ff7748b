//! # Audio Module
//!
//! Everything between the first uploaded chunk and the waveform handed to the
//! voice pipeline.
//!
//! ## Key Components:
//! - **Chunk Store**: append-only container file in a per-session scratch directory
//! - **Transcoder**: container → mono 16-bit PCM waveform (symphonia, ffmpeg for Opus)
//! - **Session Registry**: one live session per client, plus push channel bookkeeping
//! - **Session Manager**: the start / append / stop lifecycle and background processing
//!
//! ## Canonical Waveform:
//! - **Sample Rate**: the source rate, or `transcoder.ffmpeg_sample_rate` when ffmpeg decoded it
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (multi-channel input is averaged)
//! - **Encoding**: Little-endian signed integers

pub mod chunk_store; // Append-only container storage
pub mod manager; // Session lifecycle orchestration
pub mod session; // Session state and registry
pub mod transcoder; // Container decoding

pub use manager::{SessionManager, StopOutcome};
