//! # Session Manager
//!
//! Orchestrates a recording from `start` to cleanup:
//! start → append chunks → stop → (background) transcode → pipeline → stream → close.
//!
//! ## Cleanup:
//! Every way a session can end converges on [`SessionManager::close`]. It claims
//! the session's `closed` flag with a compare-and-swap, and only the winner
//! releases the scratch directory, removes the registry entry and detaches the
//! push channel. Losing triggers return quietly.
//!
//! ## Background Processing:
//! `stop` finalizes the container and returns a [`ProcessingHandle`] right away.
//! The spawned task is wrapped in `catch_unwind` and an optional deadline, so a
//! hung or panicking pipeline still ends in cleanup. Errors are caught only at
//! that boundary: logged, reported to the client as `Error: <message>`, then
//! the session is closed.

use crate::audio::chunk_store::ChunkStore;
use crate::audio::session::{AppendReceipt, Session, SessionRegistry, SessionState};
use crate::audio::transcoder::Transcoder;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::pipeline::{self, OutputEvent, PipelineAdapter};
use crate::transport::Transport;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Output was fully streamed
    Completed,
    /// Finalize, decode, pipeline or deadline failure
    Failed,
    /// The client went away before stopping, or the server is shutting down
    Abandoned,
}

/// Result of `stop`.
pub enum StopOutcome {
    /// Processing was started in the background.
    Processing {
        container_path: PathBuf,
        handle: ProcessingHandle,
    },
    /// No recording was in progress for the client.
    NothingToStop,
}

/// Handle on a detached processing task. Dropping it does not cancel the task.
pub struct ProcessingHandle(JoinHandle<()>);

impl ProcessingHandle {
    /// Wait for processing (and cleanup) to finish.
    pub async fn wait(self) {
        if let Err(e) = self.0.await {
            error!(error = %e, "Processing task did not run to completion");
        }
    }
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub attached_channels: usize,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_abandoned: u64,
    pub pipeline: &'static str,
}

struct ManagerInner {
    registry: SessionRegistry,
    transcoder: Transcoder,
    adapter: PipelineAdapter,
    output_dir: PathBuf,
    processing_timeout: Option<Duration>,
    counters: Counters,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        registry: SessionRegistry,
        transcoder: Transcoder,
        adapter: PipelineAdapter,
        output_dir: PathBuf,
        processing_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                transcoder,
                adapter,
                output_dir,
                processing_timeout,
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let registry = SessionRegistry::new(
            config.storage.scratch_dir.clone(),
            config.storage.container_extension.clone(),
            config.sessions.max_concurrent_sessions,
        );
        let adapter = PipelineAdapter::new(pipeline::build(&config.pipeline)?);

        Ok(Self::new(
            registry,
            Transcoder::from_config(&config.transcoder),
            adapter,
            config.storage.output_dir.clone(),
            config.sessions.processing_timeout(),
        ))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Begin a recording for `client_id`.
    pub async fn start(&self, client_id: &str) -> AppResult<Arc<Session>> {
        let session = self.inner.registry.create(client_id).await?;
        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(
            client_id,
            session_id = %session.session_id,
            channel_attached = session.has_transport(),
            "Recording started"
        );
        Ok(session)
    }

    /// Append one chunk to the client's recording.
    pub async fn append(
        &self,
        client_id: &str,
        bytes: &[u8],
        chunk_index: Option<u64>,
    ) -> AppResult<AppendReceipt> {
        let session = self.inner.registry.get(client_id)?;
        let receipt = session.append(bytes, chunk_index).await?;
        debug!(
            client_id,
            chunk_index = receipt.chunk_index,
            chunk_bytes = bytes.len(),
            total_bytes = receipt.bytes_received,
            "Chunk appended"
        );
        Ok(receipt)
    }

    /// Finalize the recording and hand it to background processing.
    ///
    /// ## Returns:
    /// - `NothingToStop` if the client has no session, or its session is past `Recording`
    /// - `Processing` with the durable container path otherwise
    ///
    /// ## Errors:
    /// `Io` if the container cannot be finalized. The session is closed before returning.
    pub async fn stop(&self, client_id: &str) -> AppResult<StopOutcome> {
        let session = match self.inner.registry.get(client_id) {
            Ok(session) => session,
            Err(_) => {
                debug!(client_id, "Stop requested with no active recording");
                return Ok(StopOutcome::NothingToStop);
            }
        };

        let finalized = {
            let mut recording = session.lock_recording().await;
            if session.is_closed() || session.state() != SessionState::Recording {
                debug!(client_id, state = %session.state(), "Stop ignored, recording already ended");
                return Ok(StopOutcome::NothingToStop);
            }
            session.set_state(SessionState::Finalizing);
            recording
                .store
                .finalize(client_id, &self.inner.output_dir)
                .await
        };

        match finalized {
            Ok(container_path) => {
                info!(
                    client_id,
                    session_id = %session.session_id,
                    container = %container_path.display(),
                    "Recording finalized, processing in background"
                );
                let handle = self.spawn_processing(session, container_path.clone());
                Ok(StopOutcome::Processing {
                    container_path,
                    handle,
                })
            }
            Err(e) => {
                error!(client_id, error = %e, "Failed to finalize recording");
                let mut dispatcher = Dispatcher::new(session.clone());
                dispatcher.report(&e).await;
                self.close(&session, CloseReason::Failed).await;
                Err(e)
            }
        }
    }

    /// Register a push channel for `client_id`.
    pub fn attach_transport(&self, client_id: &str, transport: Weak<dyn Transport>) -> Uuid {
        self.inner.registry.attach_transport(client_id, transport)
    }

    /// A push channel identified by `ticket` went away.
    ///
    /// A session still in `Recording` will never see its `stop`, so it is
    /// abandoned. Sessions already processing finish on their own.
    pub async fn disconnect(&self, client_id: &str, ticket: Uuid) {
        if !self.inner.registry.detach_transport_if(client_id, ticket) {
            debug!(client_id, %ticket, "Superseded channel closed");
            return;
        }

        let session = match self.inner.registry.get(client_id) {
            Ok(session) => session,
            Err(_) => return,
        };

        let abandoned = {
            let _recording = session.lock_recording().await;
            session.state() == SessionState::Recording && session.mark_closed()
        };

        if abandoned {
            info!(client_id, session_id = %session.session_id, "Channel closed mid-recording, abandoning session");
            self.finish_close(&session, CloseReason::Abandoned).await;
        }
    }

    /// Release every live session and forget every push channel. Used on
    /// graceful shutdown.
    ///
    /// Entries leave the registry before they are closed, so late chunks see
    /// `SessionNotFound` instead of a session being torn down.
    pub async fn shutdown(&self) {
        let registry = &self.inner.registry;
        let sessions = registry.all();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Releasing live sessions");
        }
        for session in sessions {
            if let Some(current) = registry.remove(&session.client_id) {
                self.close(&current, CloseReason::Abandoned).await;
            }
        }
        for client_id in registry.channel_clients() {
            registry.detach_transport(&client_id);
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let counters = &self.inner.counters;
        ManagerStats {
            active_sessions: self.inner.registry.len(),
            max_sessions: self.inner.registry.max_sessions(),
            attached_channels: self.inner.registry.channel_count(),
            sessions_started: counters.started.load(Ordering::Relaxed),
            sessions_completed: counters.completed.load(Ordering::Relaxed),
            sessions_failed: counters.failed.load(Ordering::Relaxed),
            sessions_abandoned: counters.abandoned.load(Ordering::Relaxed),
            pipeline: self.inner.adapter.pipeline_name(),
        }
    }

    pub fn pipeline_name(&self) -> &'static str {
        self.inner.adapter.pipeline_name()
    }

    /// Returns `true` only for the call that actually performed the cleanup.
    async fn close(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        if !session.mark_closed() {
            return false;
        }
        self.finish_close(session, reason).await;
        true
    }

    /// Release everything a session owns. Caller must have won `mark_closed`.
    async fn finish_close(&self, session: &Arc<Session>, reason: CloseReason) {
        session.lock_recording().await.store.discard();
        ChunkStore::release(session.scratch_dir()).await;
        self.inner.registry.remove_session(session);
        session.set_transport(None);

        let counter = match reason {
            CloseReason::Completed => &self.inner.counters.completed,
            CloseReason::Failed => &self.inner.counters.failed,
            CloseReason::Abandoned => &self.inner.counters.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        info!(
            client_id = %session.client_id,
            session_id = %session.session_id,
            ?reason,
            "Session closed"
        );
    }

    fn spawn_processing(&self, session: Arc<Session>, container_path: PathBuf) -> ProcessingHandle {
        let manager = self.clone();
        ProcessingHandle(tokio::spawn(async move {
            manager.process(session, container_path).await;
        }))
    }

    async fn process(self, session: Arc<Session>, container_path: PathBuf) {
        let mut dispatcher = Dispatcher::new(session.clone());

        let outcome = {
            let work = AssertUnwindSafe(self.run_pipeline(&session, container_path, &mut dispatcher))
                .catch_unwind();

            let caught = match self.inner.processing_timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(caught) => caught,
                    Err(_) => Ok(Err(AppError::ProcessingTimeout(limit))),
                },
                None => work.await,
            };

            caught.unwrap_or_else(|panic| {
                Err(AppError::Internal(format!(
                    "processing task panicked: {}",
                    panic_message(panic.as_ref())
                )))
            })
        };

        match outcome {
            Ok(()) => {
                info!(
                    client_id = %session.client_id,
                    session_id = %session.session_id,
                    delivered = dispatcher.delivered,
                    dropped = dispatcher.dropped,
                    "Processing complete"
                );
                self.close(&session, CloseReason::Completed).await;
            }
            Err(e) => {
                warn!(
                    client_id = %session.client_id,
                    session_id = %session.session_id,
                    kind = e.kind(),
                    error = %e,
                    "Processing failed"
                );
                dispatcher.report(&e).await;
                self.close(&session, CloseReason::Failed).await;
            }
        }
    }

    async fn run_pipeline(
        &self,
        session: &Arc<Session>,
        container_path: PathBuf,
        dispatcher: &mut Dispatcher,
    ) -> AppResult<()> {
        session.set_state(SessionState::Processing);
        let owner = session.clone();
        let waveform = self
            .inner
            .transcoder
            .decode_to(container_path, session.waveform_path().to_path_buf(), move || {
                owner.is_closed()
            })
            .await?;

        session.set_state(SessionState::Streaming);
        let mut events = self.inner.adapter.run(waveform).await?;
        while let Some(event) = events.next().await {
            dispatcher.dispatch(event?).await;
        }
        Ok(())
    }
}

/// Pushes output to whichever channel the session currently has.
///
/// The weak reference is upgraded on every send, so a reconnecting client
/// picks up the rest of the stream. After the first failed send the
/// dispatcher is severed and drops everything else.
struct Dispatcher {
    session: Arc<Session>,
    severed: bool,
    delivered: usize,
    dropped: usize,
}

impl Dispatcher {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            severed: false,
            delivered: 0,
            dropped: 0,
        }
    }

    async fn dispatch(&mut self, event: OutputEvent) {
        if self.severed {
            self.dropped += 1;
            return;
        }

        let transport = match self.session.transport() {
            Some(transport) => transport,
            None => {
                debug!(client_id = %self.session.client_id, "No push channel, dropping output");
                self.dropped += 1;
                return;
            }
        };

        let sent = match &event {
            OutputEvent::Text(text) => transport.send_text(text).await,
            OutputEvent::AudioFrame(samples) => transport.send_frame(samples).await,
        };

        match sent {
            Ok(()) => self.delivered += 1,
            Err(e) => {
                warn!(
                    client_id = %self.session.client_id,
                    error = %e,
                    "Push channel failed, suppressing further output"
                );
                self.severed = true;
                transport.close().await;
                self.dropped += 1;
            }
        }
    }

    /// Best-effort diagnostic for the client.
    async fn report(&mut self, error: &AppError) {
        self.dispatch(OutputEvent::Text(format!("Error: {}", error))).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
