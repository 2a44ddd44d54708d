//! # Detection Session Management
//!
//! Owns every live connection's detection state and runs frames through the pipeline:
//! frame adaptation → inference → smoothing → display hysteresis.
//!
//! ## Session Lifecycle:
//! 1. **Connected**: `on_connect` creates the session with the engine's initial state
//!    and returns a `SessionHandle`
//! 2. **Streaming**: `on_frame` processes frames one at a time, in arrival order
//! 3. **Closed**: `on_disconnect` or `sweep_expired` removes it; late frames see
//!    `UnknownSession`
//!
//! A connection ID can be reused once its session is gone. Every session gets a fresh
//! epoch, and calls made through a `SessionHandle` only reach the session that handle
//! was issued for.
//!
//! ## Locking:
//! - The session map sits behind a `std::sync::RwLock` that is only held to look up,
//!   insert or remove entries, never across an `.await` or an inference call.
//! - Each session has its own `tokio::sync::Mutex`. Tokio's mutex is FIFO, so frames
//!   for one session run strictly in submission order while different sessions run
//!   in parallel.
//! - Inference runs on the blocking thread pool while only the session's own mutex
//!   is held.

use crate::audio::frame::{decode_base64_pcm, Frame, FrameAdapter};
use crate::config::AppConfig;
use crate::detection::{
    DisplayState, Hysteresis, Inference, InferenceEngine, RecurrentState, SmoothingController,
    SmoothingWindow, StateChange,
};
use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Tunables every new session is created with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub frame_length: usize,
    pub smoothing_window_size: usize,
    pub hysteresis_threshold: u32,
    pub speech_threshold: f32,
    pub max_concurrent_sessions: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            frame_length: config.detection.frame_length,
            smoothing_window_size: config.detection.smoothing_window_size,
            hysteresis_threshold: config.detection.hysteresis_threshold,
            speech_threshold: config.detection.speech_threshold,
            max_concurrent_sessions: config.session.max_concurrent_sessions,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Detection state of one connection.
///
/// Only ever touched while holding the session's mutex.
struct Session {
    id: String,
    recurrent_state: RecurrentState,
    frame_index: u64,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    window: SmoothingWindow,
    hysteresis: Hysteresis,
    frames_failed: u64,
}

impl Session {
    fn new(id: String, initial_state: RecurrentState, settings: &SessionSettings) -> Self {
        let now = Utc::now();
        Self {
            id,
            recurrent_state: initial_state,
            frame_index: 0,
            created_at: now,
            last_activity: now,
            window: SmoothingWindow::new(settings.smoothing_window_size),
            hysteresis: Hysteresis::new(settings.hysteresis_threshold),
            frames_failed: 0,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.id.clone(),
            frame_index: self.frame_index,
            display_state: self.hysteresis.state(),
            consecutive_count: self.hysteresis.consecutive_count(),
            smoothed_is_noisy: self.window.last_is_noisy(),
            frames_failed: self.frames_failed,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// Map entry: the session plus a flag set once it has been removed.
///
/// A frame may already hold the `Arc` when the session is removed; the flag makes
/// that frame fail with `UnknownSession` instead of resurrecting the session.
struct SessionSlot {
    epoch: u64,
    closed: AtomicBool,
    session: Mutex<Session>,
}

impl SessionSlot {
    fn new(epoch: u64, session: Session) -> Self {
        Self {
            epoch,
            closed: AtomicBool::new(false),
            session: Mutex::new(session),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Identifies one specific session, not just its connection ID.
///
/// Handed out by `on_connect`. Once that session is removed the handle stays dead,
/// even if another connection registers the same ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub connection_id: String,
    pub epoch: u64,
}

/// Frame payload in any of the encodings the transport accepts.
#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    /// Already decoded samples
    Samples(&'a [i16]),
    /// Raw little-endian 16-bit PCM
    Pcm(&'a [u8]),
    /// The same PCM, base64-encoded
    Base64(&'a str),
}

impl FramePayload<'_> {
    fn into_frame(self, adapter: &FrameAdapter) -> SessionResult<Frame> {
        match self {
            FramePayload::Samples(samples) => adapter.adapt(samples),
            FramePayload::Pcm(bytes) => adapter.adapt_bytes(bytes),
            FramePayload::Base64(encoded) => adapter.adapt(&decode_base64_pcm(encoded)?),
        }
    }
}

/// Read-only view of a session, used for API responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: String,
    pub frame_index: u64,
    pub display_state: DisplayState,
    pub consecutive_count: u32,
    pub smoothed_is_noisy: Option<bool>,
    pub frames_failed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Result of one successfully processed frame.
///
/// ## Two categorical signals:
/// - `is_noisy` is the smoothed majority vote and may change every frame
/// - `display_state` is the hysteresis-gated state; `state_change` is set only on
///   the frame where it committed
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub connection_id: String,
    /// Frames processed so far, including this one
    pub frame_index: u64,
    pub is_noisy: bool,
    /// Mean confidence over the smoothing window
    pub confidence: f32,
    /// Raw engine output for this frame
    pub vad_probability: f32,
    pub display_state: DisplayState,
    pub state_change: Option<StateChange>,
    pub processed_at: DateTime<Utc>,
}

/// Manages all concurrent detection sessions.
///
/// ## Thread Safety:
/// Shared as `Arc<SessionManager>` between the WebSocket actors, the HTTP handlers and
/// the idle sweeper. All methods take `&self`.
pub struct SessionManager {
    /// Active sessions keyed by connection ID
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,

    /// Source of session epochs; never reused
    next_epoch: AtomicU64,

    engine: Arc<dyn InferenceEngine>,
    adapter: FrameAdapter,
    smoother: SmoothingController,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, settings: SessionSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            engine,
            adapter: FrameAdapter::new(settings.frame_length),
            smoother: SmoothingController,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub fn adapter(&self) -> FrameAdapter {
        self.adapter
    }

    // A panic while holding the map lock cannot leave the map half-updated (every
    // critical section is a single insert/remove), so poisoning is ignored.
    fn map_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn map_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the slot for `connection_id`, restricted to `epoch` when one is given.
    fn lookup(&self, connection_id: &str, epoch: Option<u64>) -> SessionResult<Arc<SessionSlot>> {
        self.map_read()
            .get(connection_id)
            .filter(|slot| epoch.map_or(true, |epoch| slot.epoch == epoch))
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(connection_id.to_string()))
    }

    /// Register a new connection.
    ///
    /// ## Returns:
    /// - **Ok(handle)**: the freshly created session
    /// - **Err(DuplicateSession)**: the ID is live; the existing session is untouched
    /// - **Err(CapacityExceeded)**: `max_concurrent_sessions` reached
    pub fn on_connect(&self, connection_id: &str) -> SessionResult<SessionHandle> {
        let mut sessions = self.map_write();

        if sessions.contains_key(connection_id) {
            warn!(connection_id, "Rejected duplicate connect");
            return Err(SessionError::DuplicateSession(connection_id.to_string()));
        }

        if sessions.len() >= self.settings.max_concurrent_sessions {
            warn!(
                connection_id,
                max_sessions = self.settings.max_concurrent_sessions,
                "Rejected connect, session limit reached"
            );
            return Err(SessionError::CapacityExceeded(self.settings.max_concurrent_sessions));
        }

        let session = Session::new(
            connection_id.to_string(),
            self.engine.initial_state(),
            &self.settings,
        );
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        sessions.insert(connection_id.to_string(), Arc::new(SessionSlot::new(epoch, session)));

        info!(connection_id, epoch, active_sessions = sessions.len(), "Session created");
        Ok(SessionHandle {
            connection_id: connection_id.to_string(),
            epoch,
        })
    }

    /// Process one frame of decoded samples.
    pub async fn on_frame(
        &self,
        connection_id: &str,
        raw_samples: &[i16],
    ) -> SessionResult<FrameOutcome> {
        self.process(connection_id, None, FramePayload::Samples(raw_samples)).await
    }

    /// Process one frame of raw little-endian PCM bytes.
    pub async fn on_frame_bytes(
        &self,
        connection_id: &str,
        payload: &[u8],
    ) -> SessionResult<FrameOutcome> {
        self.process(connection_id, None, FramePayload::Pcm(payload)).await
    }

    /// Process one frame of base64-encoded PCM.
    pub async fn on_frame_base64(
        &self,
        connection_id: &str,
        encoded: &str,
    ) -> SessionResult<FrameOutcome> {
        self.process(connection_id, None, FramePayload::Base64(encoded)).await
    }

    /// Process one frame for the exact session `handle` was issued for.
    ///
    /// Fails with `UnknownSession` once that session is gone, even if the connection
    /// ID has since been registered again.
    pub async fn submit(
        &self,
        handle: &SessionHandle,
        payload: FramePayload<'_>,
    ) -> SessionResult<FrameOutcome> {
        self.process(&handle.connection_id, Some(handle.epoch), payload).await
    }

    async fn process(
        &self,
        connection_id: &str,
        epoch: Option<u64>,
        payload: FramePayload<'_>,
    ) -> SessionResult<FrameOutcome> {
        let slot = self.lookup(connection_id, epoch)?;

        // Waits only for earlier frames of this same session
        let mut session = slot.session.lock().await;
        if slot.is_closed() {
            return Err(SessionError::UnknownSession(connection_id.to_string()));
        }

        let frame = match payload.into_frame(&self.adapter) {
            Ok(frame) => frame,
            Err(err) => {
                session.frames_failed += 1;
                warn!(connection_id, error = %err, "Dropped invalid frame");
                return Err(err);
            }
        };

        let prior_state = session.recurrent_state.clone();
        let inference = match self.run_inference(frame, prior_state).await {
            Ok(inference) => inference,
            Err(err) => {
                session.frames_failed += 1;
                error!(
                    connection_id,
                    frame_index = session.frame_index,
                    error = %err,
                    "Inference failed, keeping previous recurrent state"
                );
                return Err(err);
            }
        };

        let now = Utc::now();
        let probability = inference.probability;
        session.recurrent_state = inference.state;
        session.frame_index += 1;
        session.last_activity = now;

        let raw_is_noisy = probability <= self.settings.speech_threshold;
        let smoothed = self
            .smoother
            .update(&mut session.window, raw_is_noisy, probability, now);
        let state_change = session.hysteresis.observe(smoothed.is_noisy);

        debug!(
            connection_id,
            frame_index = session.frame_index,
            vad_probability = probability,
            is_noisy = smoothed.is_noisy,
            confidence = smoothed.confidence,
            "Frame processed"
        );

        if let Some(change) = state_change {
            info!(
                connection_id,
                frame_index = session.frame_index,
                from = change.from.as_str(),
                to = change.to.as_str(),
                "Display state changed"
            );
        }

        Ok(FrameOutcome {
            connection_id: connection_id.to_string(),
            frame_index: session.frame_index,
            is_noisy: smoothed.is_noisy,
            confidence: smoothed.confidence,
            vad_probability: probability,
            display_state: session.hysteresis.state(),
            state_change,
            processed_at: now,
        })
    }

    /// Run the engine on the blocking pool and check its output.
    async fn run_inference(
        &self,
        frame: Frame,
        prior_state: RecurrentState,
    ) -> SessionResult<Inference> {
        let engine = Arc::clone(&self.engine);
        let inference = tokio::task::spawn_blocking(move || engine.infer(&frame, &prior_state))
            .await
            .map_err(|e| SessionError::InferenceFailure(format!("inference task aborted: {}", e)))?
            .map_err(|e| SessionError::InferenceFailure(e.to_string()))?;

        if !(0.0..=1.0).contains(&inference.probability) {
            return Err(SessionError::InferenceFailure(format!(
                "engine returned probability {} outside [0, 1]",
                inference.probability
            )));
        }

        Ok(inference)
    }

    /// Remove a connection's session. Removing an absent session is a no-op.
    ///
    /// A frame already running for this session finishes; its result is simply
    /// never delivered. Frames still waiting get `UnknownSession`.
    pub fn on_disconnect(&self, connection_id: &str) -> bool {
        self.remove(connection_id, None)
    }

    /// Remove the session `handle` was issued for, if it is still registered.
    ///
    /// A newer session under the same connection ID is left alone.
    pub fn release(&self, handle: &SessionHandle) -> bool {
        self.remove(&handle.connection_id, Some(handle.epoch))
    }

    /// Whether the session `handle` was issued for is still registered.
    pub fn is_live(&self, handle: &SessionHandle) -> bool {
        self.lookup(&handle.connection_id, Some(handle.epoch)).is_ok()
    }

    fn remove(&self, connection_id: &str, epoch: Option<u64>) -> bool {
        let removed = {
            let mut sessions = self.map_write();
            let matches = sessions
                .get(connection_id)
                .is_some_and(|slot| epoch.map_or(true, |epoch| slot.epoch == epoch));
            if matches {
                sessions.remove(connection_id)
            } else {
                None
            }
        };

        match removed {
            Some(slot) => {
                slot.close();
                info!(connection_id, epoch = slot.epoch, "Session removed on disconnect");
                true
            }
            None => {
                debug!(connection_id, "Disconnect for absent session ignored");
                false
            }
        }
    }

    /// Evict every session idle for longer than `idle_timeout` as of `now`.
    ///
    /// Sessions with a frame in flight are active by definition and are skipped.
    /// Returns the number of sessions removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
        let mut sessions = self.map_write();

        let expired: Vec<String> = sessions
            .iter()
            .filter_map(|(id, slot)| {
                let session = slot.session.try_lock().ok()?;
                let idle = now.signed_duration_since(session.last_activity).to_std().ok()?;
                (idle > idle_timeout).then(|| id.clone())
            })
            .collect();

        for connection_id in &expired {
            if let Some(slot) = sessions.remove(connection_id) {
                slot.close();
                info!(
                    connection_id = connection_id.as_str(),
                    idle_timeout_secs = idle_timeout.as_secs_f64(),
                    "Evicted idle session"
                );
            }
        }

        expired.len()
    }

    /// Get the number of active sessions.
    pub fn session_count(&self) -> usize {
        self.map_read().len()
    }

    /// Snapshot one session.
    pub async fn snapshot(&self, connection_id: &str) -> SessionResult<SessionSnapshot> {
        let slot = self.lookup(connection_id, None)?;
        let session = slot.session.lock().await;
        Ok(session.snapshot())
    }

    /// Snapshot every live session, ordered by connection ID.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Arc<SessionSlot>> = self.map_read().values().cloned().collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            if slot.is_closed() {
                continue;
            }
            snapshots.push(slot.session.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use base64::{engine::general_purpose, Engine as _};
    use std::sync::Mutex as StdMutex;

    const FAIL_MARKER: i16 = -1;
    const SLOW_MARKER: i16 = -2;

    /// Stub engine: state is a counter, probability is `first_sample / 1000`.
    ///
    /// Records every state it was called with, per session counter value.
    #[derive(Default)]
    struct CountingEngine {
        seen_states: StdMutex<Vec<f32>>,
    }

    impl InferenceEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn initial_state(&self) -> RecurrentState {
            RecurrentState::new(vec![0.0])
        }

        fn infer(&self, frame: &Frame, state: &RecurrentState) -> anyhow::Result<Inference> {
            let counter = state.as_slice()[0];
            self.seen_states.lock().unwrap().push(counter);

            let first = frame.samples()[0];
            if first == FAIL_MARKER {
                return Err(anyhow!("scripted failure"));
            }
            if first == SLOW_MARKER {
                std::thread::sleep(Duration::from_millis(500));
            }

            Ok(Inference {
                probability: (first.max(0) as f32 / 1000.0).min(1.0),
                state: RecurrentState::new(vec![counter + 1.0]),
            })
        }
    }

    fn settings(window: usize, threshold: u32) -> SessionSettings {
        SessionSettings {
            frame_length: 4,
            smoothing_window_size: window,
            hysteresis_threshold: threshold,
            speech_threshold: 0.5,
            max_concurrent_sessions: 8,
        }
    }

    fn manager_with(engine: Arc<CountingEngine>, settings: SessionSettings) -> SessionManager {
        SessionManager::new(engine, settings)
    }

    #[tokio::test]
    async fn test_frame_index_and_state_continuity() {
        let engine = Arc::new(CountingEngine::default());
        let manager = manager_with(engine.clone(), settings(4, 3));
        manager.on_connect("A").unwrap();

        for expected in 1..=5u64 {
            let outcome = manager.on_frame("A", &[800, 0, 0, 0]).await.unwrap();
            assert_eq!(outcome.frame_index, expected);
        }

        // Each call received exactly the state produced by the previous call
        assert_eq!(*engine.seen_states.lock().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));
        manager.on_connect("A").unwrap();

        assert!(manager.on_disconnect("A"));
        assert!(!manager.on_disconnect("A"));
        assert_eq!(manager.session_count(), 0);

        let err = manager.on_frame("A", &[1]).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_duplicate_connect_leaves_existing_session() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));
        manager.on_connect("A").unwrap();
        manager.on_frame("A", &[900]).await.unwrap();
        manager.on_frame("A", &[900]).await.unwrap();

        let err = manager.on_connect("A").unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSession(_)));
        assert_eq!(manager.snapshot("A").await.unwrap().frame_index, 2);
    }

    #[tokio::test]
    async fn test_invalid_frame_keeps_session_alive() {
        let engine = Arc::new(CountingEngine::default());
        let manager = manager_with(engine.clone(), settings(4, 3));
        manager.on_connect("A").unwrap();
        manager.on_frame("A", &[900]).await.unwrap();

        let err = manager.on_frame("A", &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidFrame(_)));
        let err = manager.on_frame_bytes("A", &[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidFrame(_)));

        let snapshot = manager.snapshot("A").await.unwrap();
        assert_eq!(snapshot.frame_index, 1);
        assert_eq!(snapshot.frames_failed, 2);

        let outcome = manager.on_frame("A", &[900]).await.unwrap();
        assert_eq!(outcome.frame_index, 2);
        // The engine never saw the rejected frames
        assert_eq!(*engine.seen_states.lock().unwrap(), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_inference_failure_keeps_prior_state() {
        let engine = Arc::new(CountingEngine::default());
        let manager = manager_with(engine.clone(), settings(4, 3));
        manager.on_connect("A").unwrap();

        manager.on_frame("A", &[900]).await.unwrap();
        manager.on_frame("A", &[900]).await.unwrap();
        let err = manager.on_frame("A", &[FAIL_MARKER]).await.unwrap_err();
        assert!(matches!(err, SessionError::InferenceFailure(_)));

        let outcome = manager.on_frame("A", &[900]).await.unwrap();
        assert_eq!(outcome.frame_index, 3);
        // The retry after the failure saw the same state as the failed call
        assert_eq!(*engine.seen_states.lock().unwrap(), vec![0.0, 1.0, 2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions_without_resurrection() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));
        manager.on_connect("A").unwrap();

        // Nothing is idle yet
        assert_eq!(manager.sweep_expired(Utc::now(), Duration::from_secs(1)), 0);

        let later = Utc::now() + chrono::Duration::milliseconds(1500);
        assert_eq!(manager.sweep_expired(later, Duration::from_secs(1)), 1);
        assert_eq!(manager.session_count(), 0);

        let err = manager.on_frame("A", &[900]).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_during_inflight_frame_fails_queued_frames() {
        let manager = Arc::new(manager_with(Arc::new(CountingEngine::default()), settings(4, 3)));
        manager.on_connect("A").unwrap();

        let in_flight = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.on_frame("A", &[SLOW_MARKER]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Already holds the slot and waits behind the slow frame
        let queued = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.on_frame("A", &[900]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.on_disconnect("A"));

        let finished = in_flight.await.unwrap().unwrap();
        assert_eq!(finished.frame_index, 1);

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_touch_reused_connection_id() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));
        let old = manager.on_connect("X").unwrap();

        let far_future = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(manager.sweep_expired(far_future, Duration::from_secs(1)), 1);
        assert!(!manager.is_live(&old));

        let new = manager.on_connect("X").unwrap();
        assert_ne!(old.epoch, new.epoch);
        let outcome = manager.submit(&new, FramePayload::Samples(&[900])).await.unwrap();
        assert_eq!(outcome.frame_index, 1);

        // Late frame from the evicted connection
        let err = manager.submit(&old, FramePayload::Samples(&[900])).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));

        // The evicted connection closing must not remove the new session
        assert!(!manager.release(&old));
        assert_eq!(manager.session_count(), 1);
        assert!(manager.is_live(&new));

        let outcome = manager.submit(&new, FramePayload::Samples(&[900])).await.unwrap();
        assert_eq!(outcome.frame_index, 2);

        assert!(manager.release(&new));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_base64_frames_share_session_accounting() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));

        let err = manager.on_frame_base64("A", "not base64!!").await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));

        manager.on_connect("A").unwrap();
        let err = manager.on_frame_base64("A", "not base64!!").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidFrame(_)));

        let encoded = general_purpose::STANDARD.encode(900i16.to_le_bytes());
        let outcome = manager.on_frame_base64("A", &encoded).await.unwrap();
        assert_eq!(outcome.frame_index, 1);

        let snapshot = manager.snapshot("A").await.unwrap();
        assert_eq!(snapshot.frames_failed, 1);
    }

    #[tokio::test]
    async fn test_hysteresis_gates_display_but_not_confidence() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(1, 3));
        manager.on_connect("A").unwrap();

        let first = manager.on_frame("A", &[900]).await.unwrap();
        assert_eq!(first.display_state, DisplayState::Speech);
        assert!(first.state_change.is_some());

        let second = manager.on_frame("A", &[100]).await.unwrap();
        assert!(second.is_noisy);
        assert!((second.confidence - 0.1).abs() < 1e-6);
        assert_eq!(second.display_state, DisplayState::Speech);
        assert!(second.state_change.is_none());

        let third = manager.on_frame("A", &[200]).await.unwrap();
        assert!((third.confidence - 0.2).abs() < 1e-6);
        assert_eq!(third.display_state, DisplayState::Speech);

        let fourth = manager.on_frame("A", &[100]).await.unwrap();
        assert_eq!(fourth.display_state, DisplayState::NoSpeech);
        let change = fourth.state_change.unwrap();
        assert_eq!(change.from, DisplayState::Speech);
        assert_eq!(change.to, DisplayState::NoSpeech);
    }

    #[tokio::test]
    async fn test_interleaved_sessions_keep_their_own_order() {
        let engine = Arc::new(CountingEngine::default());
        let manager = Arc::new(manager_with(engine, settings(4, 3)));
        manager.on_connect("A").unwrap();
        manager.on_connect("B").unwrap();

        let mut handles = Vec::new();
        for id in ["A", "B"] {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let mut indices = Vec::new();
                for _ in 0..20 {
                    let outcome = manager.on_frame(id, &[700, 1, 2, 3]).await.unwrap();
                    indices.push(outcome.frame_index);
                    tokio::task::yield_now().await;
                }
                indices
            }));
        }

        for handle in handles {
            let indices = handle.await.unwrap();
            assert_eq!(indices, (1..=20).collect::<Vec<u64>>());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_frames_for_one_session_are_serialized() {
        let engine = Arc::new(CountingEngine::default());
        let manager = Arc::new(manager_with(engine.clone(), settings(4, 3)));
        manager.on_connect("A").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.on_frame("A", &[600]).await.unwrap().frame_index
                })
            })
            .collect();

        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (1..=16).collect::<Vec<u64>>());

        // No two calls ever observed the same state
        let mut seen = engine.seen_states.lock().unwrap().clone();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, (0..16).map(|i| i as f32).collect::<Vec<f32>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_session_does_not_block_others() {
        let manager = Arc::new(manager_with(Arc::new(CountingEngine::default()), settings(4, 3)));
        manager.on_connect("A").unwrap();
        manager.on_connect("B").unwrap();

        let slow = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.on_frame("A", &[SLOW_MARKER]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = tokio::time::timeout(Duration::from_millis(300), manager.on_frame("B", &[900]))
            .await
            .expect("session B was blocked by session A");
        assert_eq!(fast.unwrap().frame_index, 1);

        // A session with a frame in flight is never swept; idle B is
        let far_future = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(manager.sweep_expired(far_future, Duration::from_secs(1)), 1);
        assert_eq!(manager.session_count(), 1);

        assert!(slow.await.unwrap().is_ok());
        assert_eq!(manager.snapshot("A").await.unwrap().frame_index, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let mut limited = settings(4, 3);
        limited.max_concurrent_sessions = 2;
        let manager = manager_with(Arc::new(CountingEngine::default()), limited);

        manager.on_connect("A").unwrap();
        manager.on_connect("B").unwrap();
        let err = manager.on_connect("C").unwrap_err();
        assert_eq!(err, SessionError::CapacityExceeded(2));

        manager.on_disconnect("A");
        assert!(manager.on_connect("C").is_ok());
    }

    #[tokio::test]
    async fn test_snapshots_are_sorted() {
        let manager = manager_with(Arc::new(CountingEngine::default()), settings(4, 3));
        manager.on_connect("b").unwrap();
        manager.on_connect("a").unwrap();
        manager.on_frame("a", &[900]).await.unwrap();

        let snapshots = manager.snapshots().await;
        let ids: Vec<&str> = snapshots.iter().map(|s| s.connection_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshots[0].display_state, DisplayState::Speech);
        assert_eq!(snapshots[1].display_state, DisplayState::Unset);
    }
}
