//! # Chunk Store
//!
//! Append-only sink for the raw container bytes of one recording.
//!
//! ## Layout:
//! - `<scratch_root>/<uuid>/recording.<ext>`: the container as it is being uploaded
//! - `<scratch_root>/<uuid>/waveform.wav`: the decoded waveform, written later
//! - `<output_dir>/<client>_<timestamp>.<ext>`: where `finalize` moves the container
//!
//! The scratch directory belongs to exactly one session and is deleted by
//! [`ChunkStore::release`] on the session's single cleanup path.

use crate::error::{AppError, AppResult};
use chrono::{TimeZone, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const CONTAINER_STEM: &str = "recording";
const WAVEFORM_FILE: &str = "waveform.wav";

/// Last timestamp handed out by [`monotonic_micros`].
static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(0);

pub struct ChunkStore {
    scratch_dir: PathBuf,
    container_path: PathBuf,
    extension: String,
    /// `None` once finalized or discarded
    file: Option<File>,
    bytes_written: u64,
}

impl ChunkStore {
    /// Create a fresh scratch directory and an empty container inside it.
    pub async fn create(scratch_root: &Path, extension: &str) -> AppResult<Self> {
        let scratch_dir = scratch_root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&scratch_dir)
            .await
            .map_err(|e| AppError::io("creating scratch directory", e))?;

        let container_path = scratch_dir.join(format!("{}.{}", CONTAINER_STEM, extension));
        let file = match File::create(&container_path).await {
            Ok(file) => file,
            Err(e) => {
                Self::release(&scratch_dir).await;
                return Err(AppError::io("creating container file", e));
            }
        };

        debug!(path = %container_path.display(), "Scratch container ready");

        Ok(Self {
            scratch_dir,
            container_path,
            extension: extension.to_string(),
            file: Some(file),
            bytes_written: 0,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    pub fn waveform_path(&self) -> PathBuf {
        self.scratch_dir.join(WAVEFORM_FILE)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append bytes to the container in call order.
    pub async fn append(&mut self, bytes: &[u8]) -> AppResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            AppError::io(
                "appending chunk",
                std::io::Error::new(ErrorKind::Other, "container is already closed"),
            )
        })?;

        if bytes.is_empty() {
            return Ok(());
        }

        file.write_all(bytes)
            .await
            .map_err(|e| AppError::io("appending chunk", e))?;
        file.flush()
            .await
            .map_err(|e| AppError::io("flushing chunk", e))?;

        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Close the container and move it into `output_dir`.
    ///
    /// ## Naming:
    /// `<client_id>_<UTC timestamp>.<ext>`, where the client id is reduced to
    /// filesystem-safe characters and the timestamp comes from a monotonic clock,
    /// so back-to-back recordings from the same client never collide.
    ///
    /// ## Returns:
    /// The durable path of the container.
    pub async fn finalize(&mut self, client_id: &str, output_dir: &Path) -> AppResult<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| AppError::io("flushing container", e))?;
            file.sync_all()
                .await
                .map_err(|e| AppError::io("syncing container", e))?;
        }

        fs::create_dir_all(output_dir)
            .await
            .map_err(|e| AppError::io("creating output directory", e))?;

        let target = output_dir.join(format!(
            "{}_{}.{}",
            sanitize_client_id(client_id),
            capture_timestamp(),
            self.extension
        ));

        move_file(&self.container_path, &target)
            .await
            .map_err(|e| AppError::io("moving container to output directory", e))?;

        debug!(
            from = %self.container_path.display(),
            to = %target.display(),
            bytes = self.bytes_written,
            "Container finalized"
        );

        Ok(target)
    }

    /// Drop the open file handle without moving anything.
    pub fn discard(&mut self) {
        self.file = None;
    }

    /// Recursively delete a scratch directory.
    ///
    /// Never fails: a missing directory is expected on some paths, and anything
    /// else is only worth a warning because this runs during cleanup.
    pub async fn release(scratch_dir: &Path) {
        match fs::remove_dir_all(scratch_dir).await {
            Ok(()) => debug!(path = %scratch_dir.display(), "Scratch directory removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %scratch_dir.display(), "Scratch directory already gone")
            }
            Err(e) => warn!(
                path = %scratch_dir.display(),
                error = %e,
                "Failed to remove scratch directory"
            ),
        }
    }
}

/// Rename, falling back to copy + remove when crossing filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(error = %rename_err, "Rename failed, copying container instead");
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
    }
}

/// Keep ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
fn sanitize_client_id(client_id: &str) -> String {
    let cleaned: String = client_id
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if cleaned.is_empty() {
        "client".to_string()
    } else {
        cleaned
    }
}

/// Wall-clock microseconds, forced to be strictly increasing within the process.
fn monotonic_micros() -> i64 {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_STAMP_MICROS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    now.max(previous + 1)
}

fn capture_timestamp() -> String {
    let micros = monotonic_micros();
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y%m%dT%H%M%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::create(root.path(), "webm").await.unwrap();

        store.append(b"first-").await.unwrap();
        store.append(b"").await.unwrap();
        store.append(b"second-").await.unwrap();
        store.append(b"third").await.unwrap();
        assert_eq!(store.bytes_written(), 18);

        let path = store.finalize("c1", out.path()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first-second-third");
        assert!(path.starts_with(out.path()));
        assert!(!store.container_path().exists());
    }

    #[tokio::test]
    async fn test_append_after_finalize_fails() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::create(root.path(), "webm").await.unwrap();
        store.finalize("c1", out.path()).await.unwrap();

        let err = store.append(b"late").await.unwrap_err();
        assert_eq!(err.kind(), "io_failure");
    }

    #[tokio::test]
    async fn test_repeated_recordings_get_distinct_names() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut first = ChunkStore::create(root.path(), "webm").await.unwrap();
        let mut second = ChunkStore::create(root.path(), "webm").await.unwrap();
        let a = first.finalize("c1", out.path()).await.unwrap();
        let b = second.finalize("c1", out.path()).await.unwrap();

        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("c1_"));
        assert!(name.ends_with(".webm"));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(root.path(), "webm").await.unwrap();
        let dir = store.scratch_dir().to_path_buf();
        assert!(dir.exists());

        ChunkStore::release(&dir).await;
        assert!(!dir.exists());
        ChunkStore::release(&dir).await;
    }

    #[test]
    fn test_sanitize_client_id() {
        assert_eq!(sanitize_client_id("abc-123_x"), "abc-123_x");
        assert_eq!(sanitize_client_id("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_client_id(""), "client");
    }

    #[test]
    fn test_monotonic_micros_strictly_increase() {
        let stamps: Vec<i64> = (0..100).map(|_| monotonic_micros()).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }
}
