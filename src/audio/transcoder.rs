//! # Transcoder
//!
//! Turns a finalized container (webm, ogg, mp4, wav, ...) into the canonical
//! waveform the voice pipeline accepts: mono, signed 16-bit PCM.
//!
//! ## Decoders:
//! 1. **symphonia**, in process, at the source sample rate
//! 2. **ffmpeg**, as a child process, for anything symphonia rejects. Browsers
//!    record Opus, which symphonia has no decoder for.
//!
//! Decoding is CPU-bound, so [`Transcoder::decode_to`] runs it on the blocking
//! thread pool and also writes the waveform to disk as a WAV file.

use crate::config::TranscoderConfig;
use crate::error::{AppError, AppResult};
use crate::transport::decode_pcm_frame;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

/// Decoded audio ready for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_path: PathBuf,
    ffmpeg_sample_rate: u32,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_sample_rate: 16000,
        }
    }

    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffmpeg_sample_rate: config.ffmpeg_sample_rate,
        }
    }

    /// Decode a container file into a mono waveform.
    ///
    /// ## Failure Modes (all [`AppError::Transcode`]):
    /// - File is empty (e.g. `stop` with no chunks appended)
    /// - Neither symphonia nor ffmpeg can make sense of it
    /// - Decoding produced zero samples
    ///
    /// Individual corrupt packets are skipped with a warning.
    pub fn decode(&self, container_path: &Path) -> AppResult<Waveform> {
        let size = std::fs::metadata(container_path)
            .map_err(|e| AppError::io("reading container metadata", e))?
            .len();
        if size == 0 {
            return Err(AppError::Transcode("recording is empty".to_string()));
        }

        match decode_native(container_path) {
            Err(AppError::Transcode(reason)) => {
                debug!(
                    container = %container_path.display(),
                    reason = %reason,
                    "symphonia cannot decode container, falling back to ffmpeg"
                );
                self.decode_with_ffmpeg(container_path).map_err(|e| match e {
                    AppError::Transcode(fallback) => {
                        AppError::Transcode(format!("{}; ffmpeg fallback: {}", reason, fallback))
                    }
                    other => other,
                })
            }
            decoded => decoded,
        }
    }

    /// Decode through an `ffmpeg` child process into mono s16le at `ffmpeg_sample_rate`.
    fn decode_with_ffmpeg(&self, container_path: &Path) -> AppResult<Waveform> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(container_path)
            .args(["-vn", "-ac", "1", "-ar"])
            .arg(self.ffmpeg_sample_rate.to_string())
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    AppError::Transcode(format!("{} not found", self.ffmpeg_path.display()))
                }
                _ => AppError::Transcode(format!(
                    "failed to run {}: {}",
                    self.ffmpeg_path.display(),
                    e
                )),
            })?;

        if !output.status.success() {
            return Err(AppError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let samples = decode_pcm_frame(&output.stdout);
        if samples.is_empty() {
            return Err(AppError::Transcode("recording contains no audio samples".to_string()));
        }

        debug!(
            samples = samples.len(),
            sample_rate = self.ffmpeg_sample_rate,
            "Container decoded by ffmpeg"
        );

        Ok(Waveform {
            samples,
            sample_rate: self.ffmpeg_sample_rate,
        })
    }

    /// Decode on the blocking pool and persist the waveform as a 16-bit mono WAV.
    ///
    /// `abandoned` is polled around the write. Once it reports `true` the owner
    /// has released the waveform's directory: the file is not written, or is
    /// removed again together with its directory if that is now empty.
    pub async fn decode_to<F>(
        &self,
        container_path: PathBuf,
        waveform_path: PathBuf,
        abandoned: F,
    ) -> AppResult<Waveform>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let transcoder = self.clone();
        let waveform = tokio::task::spawn_blocking(move || -> AppResult<Waveform> {
            let waveform = transcoder.decode(&container_path)?;
            if abandoned() {
                debug!("Owner gone, skipping waveform file");
                return Ok(waveform);
            }

            let written = write_wav(&waveform_path, &waveform);
            if abandoned() {
                let _ = std::fs::remove_file(&waveform_path);
                if let Some(dir) = waveform_path.parent() {
                    let _ = std::fs::remove_dir(dir);
                }
                return Ok(waveform);
            }
            written.map(|()| waveform)
        })
        .await
        .map_err(|e| AppError::Internal(format!("decode task failed: {}", e)))??;

        info!(
            duration_seconds = waveform.duration_seconds(),
            sample_rate = waveform.sample_rate,
            "Waveform ready"
        );
        Ok(waveform)
    }
}

/// Decode in process with symphonia, keeping the source sample rate.
fn decode_native(container_path: &Path) -> AppResult<Waveform> {
    let file = File::open(container_path)
        .map_err(|e| AppError::io("opening container for decoding", e))?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = container_path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AppError::Transcode(format!("unrecognized container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AppError::Transcode("no audio track found".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AppError::Transcode(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<i16> = Vec::new();
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AppError::Transcode(format!("reading packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);

                let channels = spec.channels.count().max(1);
                let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                downmix_into(buffer.samples(), channels, &mut samples);
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                skipped_packets += 1;
                warn!(error = %msg, "Skipping undecodable packet");
            }
            Err(e) => return Err(AppError::Transcode(format!("decoding packet: {}", e))),
        }
    }

    if samples.is_empty() {
        return Err(AppError::Transcode("recording contains no audio samples".to_string()));
    }

    let sample_rate = sample_rate
        .ok_or_else(|| AppError::Transcode("sample rate unknown".to_string()))?;

    debug!(
        samples = samples.len(),
        sample_rate,
        skipped_packets,
        "Container decoded"
    );

    Ok(Waveform {
        samples,
        sample_rate,
    })
}

/// Average interleaved frames down to one channel.
fn downmix_into(interleaved: &[i16], channels: usize, out: &mut Vec<i16>) {
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }

    out.extend(interleaved.chunks_exact(channels).map(|frame| {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        (sum / channels as i32) as i16
    }));
}

fn write_wav(path: &Path, waveform: &Waveform) -> AppResult<()> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, waveform.sample_rate, 16);
    let mut file = File::create(path).map_err(|e| AppError::io("creating waveform file", e))?;
    wav::write(header, &wav::BitDepth::Sixteen(waveform.samples.clone()), &mut file)
        .map_err(|e| AppError::io("writing waveform file", e))
}

#[cfg(test)]
pub(crate) mod testing {
    /// Encode PCM samples as an in-memory WAV file.
    pub fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, channels, sample_rate, 16);
        let mut cursor = std::io::Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor).unwrap();
        cursor.into_inner()
    }
}
