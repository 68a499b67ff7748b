//! # Session State and Registry
//!
//! A [`Session`] tracks one client's recording from `start` until its output has
//! been streamed (or it failed). The [`SessionRegistry`] is the only place
//! sessions are created or destroyed.
//!
//! ## Session Lifecycle:
//! 1. **Recording**: accepting chunks
//! 2. **Finalizing**: `stop` received, container being moved to durable storage
//! 3. **Processing**: background task is decoding the container
//! 4. **Streaming**: pipeline output is being pushed to the client
//! 5. **Closed**: resources released, entry removed (terminal, reached from any state)
//!
//! ## Locking:
//! - The registry map sits behind a `std::sync::Mutex` that is never held across `.await`
//! - Each session serializes its chunk writes and `stop` through its own
//!   `tokio::sync::Mutex`, so one client's uploads never block another's
//! - The transport slot is swapped under a short `RwLock`

use crate::audio::chunk_store::ChunkStore;
use crate::error::{AppError, AppResult};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Recording,
    Finalizing,
    Processing,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Recording => "recording",
            SessionState::Finalizing => "finalizing",
            SessionState::Processing => "processing",
            SessionState::Streaming => "streaming",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable recording state, guarded by the session's async lock.
pub(crate) struct Recording {
    pub store: ChunkStore,
    pub next_chunk_index: u64,
}

/// Result of a successful append.
#[derive(Debug, Clone, Serialize)]
pub struct AppendReceipt {
    pub chunk_index: u64,
    pub bytes_received: u64,
}

pub struct Session {
    pub client_id: String,

    /// Correlation id for logs; distinct across repeated recordings of a client
    pub session_id: Uuid,

    pub created_at: DateTime<Utc>,

    scratch_dir: PathBuf,
    container_path: PathBuf,
    waveform_path: PathBuf,

    state: RwLock<SessionState>,

    /// Flipped exactly once by whichever cleanup trigger wins
    closed: AtomicBool,

    recording: tokio::sync::Mutex<Recording>,

    transport: RwLock<Option<Weak<dyn Transport>>>,

    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
    out_of_sequence: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(client_id: &str, store: ChunkStore) -> Self {
        Self {
            client_id: client_id.to_string(),
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            scratch_dir: store.scratch_dir().to_path_buf(),
            container_path: store.container_path().to_path_buf(),
            waveform_path: store.waveform_path(),
            state: RwLock::new(SessionState::Recording),
            closed: AtomicBool::new(false),
            recording: tokio::sync::Mutex::new(Recording {
                store,
                next_chunk_index: 0,
            }),
            transport: RwLock::new(None),
            bytes_received: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            out_of_sequence: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(client_id = %self.client_id, from = %*state, to = %next, "Session state change");
        *state = next;
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    pub fn waveform_path(&self) -> &Path {
        &self.waveform_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the right to clean this session up.
    ///
    /// Returns `true` for exactly one caller over the session's lifetime.
    pub(crate) fn mark_closed(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.set_state(SessionState::Closed);
        }
        won
    }

    pub(crate) async fn lock_recording(&self) -> tokio::sync::MutexGuard<'_, Recording> {
        self.recording.lock().await
    }

    /// Append one chunk in arrival order.
    ///
    /// `chunk_index` is advisory: a mismatch with the expected index is logged and
    /// counted, but the bytes are still appended where they arrived.
    pub async fn append(&self, bytes: &[u8], chunk_index: Option<u64>) -> AppResult<AppendReceipt> {
        let mut recording = self.lock_recording().await;

        if self.is_closed() {
            return Err(AppError::SessionNotFound(self.client_id.clone()));
        }
        let state = self.state();
        if state != SessionState::Recording {
            return Err(AppError::InvalidState {
                client_id: self.client_id.clone(),
                state,
            });
        }

        let expected = recording.next_chunk_index;
        let index = chunk_index.unwrap_or(expected);
        let next = index.max(expected).checked_add(1).ok_or_else(|| {
            AppError::BadRequest(format!("chunk_index {} is out of range", index))
        })?;
        if index != expected {
            self.out_of_sequence.fetch_add(1, Ordering::Relaxed);
            warn!(
                client_id = %self.client_id,
                expected,
                received = index,
                "Chunk index out of sequence, appending in arrival order"
            );
        }

        recording.store.append(bytes).await?;
        recording.next_chunk_index = next;

        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        let total = self.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed)
            + bytes.len() as u64;

        Ok(AppendReceipt {
            chunk_index: index,
            bytes_received: total,
        })
    }

    /// The live transport, if one is attached and its peer is still there.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|t| t.is_alive())
    }

    pub fn has_transport(&self) -> bool {
        self.transport().is_some()
    }

    pub(crate) fn set_transport(&self, transport: Option<Weak<dyn Transport>>) {
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) = transport;
    }

    pub fn out_of_sequence_chunks(&self) -> u64 {
        self.out_of_sequence.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            client_id: self.client_id.clone(),
            session_id: self.session_id,
            state: self.state(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            out_of_sequence_chunks: self.out_of_sequence_chunks(),
            channel_attached: self.has_transport(),
            age_seconds: Utc::now()
                .signed_duration_since(self.created_at)
                .num_milliseconds() as f64
                / 1000.0,
        }
    }
}

/// Point-in-time view of a session for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub client_id: String,
    pub session_id: Uuid,
    pub state: SessionState,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub out_of_sequence_chunks: u64,
    pub channel_attached: bool,
    pub age_seconds: f64,
}

/// A push channel registered for a client, independent of any session.
struct Channel {
    ticket: Uuid,
    transport: Weak<dyn Transport>,
}

/// Process-wide map of client id to live session.
///
/// Lock order is always `sessions` then `channels`.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    channels: Mutex<HashMap<String, Channel>>,
    scratch_root: PathBuf,
    container_extension: String,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(scratch_root: PathBuf, container_extension: String, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            scratch_root,
            container_extension,
            max_sessions,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self, sessions: &HashMap<String, Arc<Session>>, client_id: &str) -> AppResult<()> {
        if sessions.contains_key(client_id) {
            return Err(AppError::SessionConflict(client_id.to_string()));
        }
        if sessions.len() >= self.max_sessions {
            return Err(AppError::CapacityExceeded(self.max_sessions));
        }
        Ok(())
    }

    /// Allocate scratch storage and register a new session in `Recording`.
    ///
    /// ## Errors:
    /// - `SessionConflict` if the client already has a live session
    /// - `CapacityExceeded` when the registry is full
    /// - `Io` if the scratch directory cannot be created
    pub async fn create(&self, client_id: &str) -> AppResult<Arc<Session>> {
        // Cheap rejection before touching the disk; re-checked on insert
        self.check_available(&self.sessions(), client_id)?;

        let store = ChunkStore::create(&self.scratch_root, &self.container_extension).await?;
        let session = Arc::new(Session::new(client_id, store));

        let inserted = {
            let mut sessions = self.sessions();
            self.check_available(&sessions, client_id).map(|()| {
                if let Some(channel) = self.channels().get(client_id) {
                    session.set_transport(Some(channel.transport.clone()));
                }
                sessions.insert(client_id.to_string(), session.clone());
            })
        };

        if let Err(e) = inserted {
            ChunkStore::release(session.scratch_dir()).await;
            return Err(e);
        }

        info!(
            client_id,
            session_id = %session.session_id,
            scratch_dir = %session.scratch_dir().display(),
            "Session created"
        );
        Ok(session)
    }

    pub fn get(&self, client_id: &str) -> AppResult<Arc<Session>> {
        self.sessions()
            .get(client_id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(client_id.to_string()))
    }

    /// Remove the entry for `client_id` if there is one. Releases nothing.
    pub fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions().remove(client_id)
    }

    /// Remove `session` only if it is still the registered entry for its client.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(&session.client_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.client_id);
                true
            }
            _ => false,
        }
    }

    /// Register a push channel for `client_id`, replacing any previous one.
    ///
    /// ## Returns:
    /// A ticket identifying this attachment, for [`Self::detach_transport_if`].
    pub fn attach_transport(&self, client_id: &str, transport: Weak<dyn Transport>) -> Uuid {
        let ticket = Uuid::new_v4();
        let sessions = self.sessions();
        if let Some(session) = sessions.get(client_id) {
            session.set_transport(Some(transport.clone()));
        }
        let replaced = self
            .channels()
            .insert(client_id.to_string(), Channel { ticket, transport })
            .is_some();

        debug!(client_id, %ticket, replaced, "Push channel attached");
        ticket
    }

    /// Forget the push channel for `client_id`. Safe to call when none is attached.
    pub fn detach_transport(&self, client_id: &str) {
        let sessions = self.sessions();
        if let Some(session) = sessions.get(client_id) {
            session.set_transport(None);
        }
        if self.channels().remove(client_id).is_some() {
            debug!(client_id, "Push channel detached");
        }
    }

    /// Detach only if `ticket` is still the current attachment.
    ///
    /// Returns `false` when a newer channel has replaced it (or nothing is attached).
    pub fn detach_transport_if(&self, client_id: &str, ticket: Uuid) -> bool {
        let sessions = self.sessions();
        let mut channels = self.channels();
        match channels.get(client_id) {
            Some(channel) if channel.ticket == ticket => {
                channels.remove(client_id);
                if let Some(session) = sessions.get(client_id) {
                    session.set_transport(None);
                }
                debug!(client_id, %ticket, "Push channel detached");
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Clients with a registered push channel.
    pub fn channel_clients(&self) -> Vec<String> {
        self.channels().keys().cloned().collect()
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self.all().iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        summaries
    }

    /// Count of live sessions per state name.
    pub fn state_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for session in self.sessions().values() {
            *counts.entry(session.state().as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;

    fn registry(root: &Path, max: usize) -> SessionRegistry {
        SessionRegistry::new(root.to_path_buf(), "webm".to_string(), max)
    }

    fn weak(transport: &Arc<RecordingTransport>) -> Weak<dyn Transport> {
        let transport: Arc<dyn Transport> = transport.clone();
        Arc::downgrade(&transport)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);

        let session = registry.create("c1").await.unwrap();
        assert_eq!(session.state(), SessionState::Recording);
        assert!(session.scratch_dir().exists());
        assert!(session.container_path().exists());

        let fetched = registry.get("c1").unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));
        assert!(matches!(registry.get("c2"), Err(AppError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);

        registry.create("c1").await.unwrap();
        let err = registry.create("c1").await.unwrap_err();
        assert!(matches!(err, AppError::SessionConflict(ref id) if id == "c1"));
        assert_eq!(registry.len(), 1);
        // Only the first session's scratch directory exists
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 2);

        registry.create("a").await.unwrap();
        registry.create("b").await.unwrap();
        let err = registry.create("c").await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded(2)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);

        let session = registry.create("c1").await.unwrap();
        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.remove("never-existed").is_none());
        assert!(!registry.remove_session(&session));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_session_ignores_newer_entry() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);

        let old = registry.create("c1").await.unwrap();
        assert!(registry.remove_session(&old));
        let new = registry.create("c1").await.unwrap();

        assert!(!registry.remove_session(&old));
        assert!(registry.remove_session(&new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_channel_attached_before_start_is_picked_up() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let transport = Arc::new(RecordingTransport::default());

        registry.attach_transport("c1", weak(&transport));
        let session = registry.create("c1").await.unwrap();
        assert!(session.has_transport());
    }

    #[tokio::test]
    async fn test_stale_ticket_does_not_detach_replacement() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let session = registry.create("c1").await.unwrap();

        let first = Arc::new(RecordingTransport::default());
        let second = Arc::new(RecordingTransport::default());
        let old_ticket = registry.attach_transport("c1", weak(&first));
        let new_ticket = registry.attach_transport("c1", weak(&second));

        assert!(!registry.detach_transport_if("c1", old_ticket));
        assert!(session.has_transport());
        assert!(registry.detach_transport_if("c1", new_ticket));
        assert!(!session.has_transport());
        assert_eq!(registry.channel_count(), 0);

        // Nothing attached any more
        assert!(!registry.detach_transport_if("c1", new_ticket));
        assert!(!registry.detach_transport_if("nobody", new_ticket));

        registry.attach_transport("c1", weak(&first));
        assert_eq!(registry.channel_clients(), vec!["c1".to_string()]);
        registry.detach_transport("c1");
        assert!(!session.has_transport());
        registry.detach_transport("nobody");
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_transport_reads_as_absent() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let session = registry.create("c1").await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        registry.attach_transport("c1", weak(&transport));
        assert!(session.has_transport());

        drop(transport);
        assert!(!session.has_transport());
    }

    #[tokio::test]
    async fn test_append_tracks_out_of_sequence_chunks() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let session = registry.create("c1").await.unwrap();

        session.append(b"aa", Some(0)).await.unwrap();
        let receipt = session.append(b"bbb", Some(2)).await.unwrap();
        assert_eq!(receipt.chunk_index, 2);
        assert_eq!(receipt.bytes_received, 5);
        // Unindexed chunks take the next expected slot
        let receipt = session.append(b"c", None).await.unwrap();
        assert_eq!(receipt.chunk_index, 3);

        assert_eq!(session.out_of_sequence_chunks(), 1);
        assert_eq!(std::fs::read(session.container_path()).unwrap(), b"aabbbc");

        let summary = session.summary();
        assert_eq!(summary.chunks_received, 3);
        assert_eq!(summary.bytes_received, 6);
    }

    #[tokio::test]
    async fn test_last_possible_chunk_index_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let session = registry.create("c1").await.unwrap();

        session.append(b"aa", Some(0)).await.unwrap();
        let err = session.append(b"x", Some(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        // Nothing written or counted
        assert_eq!(std::fs::read(session.container_path()).unwrap(), b"aa");
        assert_eq!(session.summary().chunks_received, 1);
        assert_eq!(session.out_of_sequence_chunks(), 0);

        let receipt = session.append(b"b", None).await.unwrap();
        assert_eq!(receipt.chunk_index, 1);
    }

    #[tokio::test]
    async fn test_append_outside_recording_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), 4);
        let session = registry.create("c1").await.unwrap();

        session.set_state(SessionState::Processing);
        let err = session.append(b"x", None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState { state: SessionState::Processing, .. }));

        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        let err = session.append(b"x", None).await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }
}
