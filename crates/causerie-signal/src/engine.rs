//! Call engine with the tokio mpsc command/event pattern.
//!
//! One task owns every live call session, so per-call state needs no
//! locking.  Operator commands and remote call records arrive on the
//! command channel; per-call watcher, candidate pump, and timer tasks
//! report back over an internal channel.  Replayed and echoed records are
//! absorbed by the `from` filter, the pure session transitions, and the
//! recently-ended tombstone set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use causerie_shared::constants::{
    CALL_ESTABLISH_TIMEOUT_SECS, CHANNEL_CAPACITY, ENDED_CALL_MEMORY_SECS,
};
use causerie_shared::records::{CallKind, CallRecord, IceCandidate, IceRecord};
use causerie_shared::{Alias, CallId};
use causerie_store::{KeyPath, ReplicatedStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::{MediaFactory, MediaSession};
use crate::session::{CallRole, CallSession, CallState, Step};

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub enum SignalCommand {
    /// Originate a call to a peer.
    Start { peer: Alias, video: bool },
    /// Accept the ringing call.
    Accept { call_id: CallId },
    /// Decline the ringing call.
    Reject { call_id: CallId },
    /// Tear down a call in any state.
    HangUp { call_id: CallId },
    /// A call record observed on the store, addressed to this node.
    Remote { call_id: CallId, record: CallRecord },
}

/// Events sent *from* the engine to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// A peer is calling; accept or reject with the carried id.
    IncomingOffer {
        call_id: CallId,
        from: Alias,
        is_video: bool,
    },
    /// The call was answered at the signaling level.
    Answered { call_id: CallId, peer: Alias },
    /// The call is over.
    Ended { call_id: CallId, reason: EndReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    Rejected,
    TimedOut,
    Failed,
}

pub struct EngineConfig {
    /// How long a call may sit unestablished before it is force-ended.
    pub establish_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            establish_timeout: Duration::from_secs(CALL_ESTABLISH_TIMEOUT_SECS),
        }
    }
}

/// Reports from per-call helper tasks back into the engine loop.
enum EngineInternal {
    RemoteIce { call_id: CallId, record: IceRecord },
    EstablishTick { call_id: CallId },
}

struct ActiveCall {
    session: CallSession,
    /// Absent for a ringing callee until the call is accepted.
    media: Option<Box<dyn MediaSession>>,
    /// Remote candidates held until the session has a remote description.
    pending_ice: Vec<IceCandidate>,
    remote_ready: bool,
    /// ICE watcher, candidate pump, establishment timer.
    tasks: Vec<JoinHandle<()>>,
}

/// Spawn the call engine in a background tokio task.
///
/// Returns `(command_tx, event_rx)`.
pub fn spawn_engine(
    local: Alias,
    store: Arc<dyn ReplicatedStore>,
    media: Arc<dyn MediaFactory>,
    config: EngineConfig,
) -> (mpsc::Sender<SignalCommand>, mpsc::Receiver<SignalEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SignalCommand>(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<SignalEvent>(CHANNEL_CAPACITY);
    let (internal_tx, mut internal_rx) = mpsc::channel::<EngineInternal>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut engine = Engine {
            local,
            store,
            media,
            config,
            events: event_tx,
            internal: internal_tx,
            calls: HashMap::new(),
            recently_ended: HashMap::new(),
        };

        loop {
            tokio::select! {
                // --- Operator commands and routed records ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SignalCommand::Start { peer, video }) => {
                            engine.start_call(peer, video).await;
                        }
                        Some(SignalCommand::Accept { call_id }) => {
                            engine.accept_call(&call_id).await;
                        }
                        Some(SignalCommand::Reject { call_id }) => {
                            engine.reject_call(&call_id).await;
                        }
                        Some(SignalCommand::HangUp { call_id }) => {
                            engine.hang_up(&call_id).await;
                        }
                        Some(SignalCommand::Remote { call_id, record }) => {
                            engine.on_remote_record(call_id, record).await;
                        }
                        None => {
                            info!("Command channel closed, stopping call engine");
                            break;
                        }
                    }
                }

                // --- Per-call helper tasks ---
                Some(internal) = internal_rx.recv() => {
                    match internal {
                        EngineInternal::RemoteIce { call_id, record } => {
                            engine.on_remote_ice(&call_id, record).await;
                        }
                        EngineInternal::EstablishTick { call_id } => {
                            engine.on_establish_tick(&call_id).await;
                        }
                    }
                }
            }
        }

        engine.shutdown().await;
        info!("Call engine terminated");
    });

    (cmd_tx, event_rx)
}

struct Engine {
    local: Alias,
    store: Arc<dyn ReplicatedStore>,
    media: Arc<dyn MediaFactory>,
    config: EngineConfig,
    events: mpsc::Sender<SignalEvent>,
    internal: mpsc::Sender<EngineInternal>,
    calls: HashMap<CallId, ActiveCall>,
    recently_ended: HashMap<CallId, Instant>,
}

impl Engine {
    async fn start_call(&mut self, peer: Alias, video: bool) {
        if !self.calls.is_empty() {
            warn!(peer = %peer, "already in a call, ignoring start");
            return;
        }

        let call_id = CallId::new();
        let (cand_tx, cand_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let media = match self.media.create_session(video, cand_tx).await {
            Ok(media) => media,
            Err(error) => {
                warn!(peer = %peer, %error, "failed to create media session");
                return;
            }
        };
        let offer_sdp = match media.create_offer().await {
            Ok(sdp) => sdp,
            Err(error) => {
                warn!(peer = %peer, %error, "failed to create offer");
                media.close().await;
                return;
            }
        };

        let record = CallRecord::offer(&call_id, &self.local, &peer, offer_sdp, video);
        self.write_record(&call_id, &record).await;

        let tasks = vec![
            self.spawn_ice_watcher(&call_id).await,
            self.spawn_candidate_pump(&call_id, cand_rx),
            self.spawn_establish_timer(&call_id),
        ];
        info!(call = %call_id, peer = %peer, video, "outgoing call offered");
        self.calls.insert(
            call_id.clone(),
            ActiveCall {
                session: CallSession::caller(call_id, peer, video),
                media: Some(media),
                pending_ice: Vec::new(),
                remote_ready: false,
                tasks,
            },
        );
    }

    async fn accept_call(&mut self, call_id: &CallId) {
        let (peer, is_video, offer_sdp) = match self.calls.get(call_id) {
            Some(call)
                if call.session.role() == CallRole::Callee
                    && call.session.state() == CallState::Offered =>
            {
                match call.session.offer_sdp() {
                    Some(offer) => (
                        call.session.peer().clone(),
                        call.session.is_video(),
                        offer.to_string(),
                    ),
                    None => {
                        warn!(call = %call_id, "accept without stored offer");
                        return;
                    }
                }
            }
            _ => {
                warn!(call = %call_id, "accept for unknown or non-ringing call");
                return;
            }
        };

        let (cand_tx, cand_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let media = match self.media.create_session(is_video, cand_tx).await {
            Ok(media) => media,
            Err(error) => {
                warn!(call = %call_id, %error, "failed to create media session");
                self.force_end(call_id, EndReason::Failed).await;
                return;
            }
        };
        let answer_sdp = match media.create_answer(&offer_sdp).await {
            Ok(sdp) => sdp,
            Err(error) => {
                warn!(call = %call_id, %error, "failed to create answer");
                media.close().await;
                self.force_end(call_id, EndReason::Failed).await;
                return;
            }
        };

        let pump = self.spawn_candidate_pump(call_id, cand_rx);
        let timer = self.spawn_establish_timer(call_id);
        match self.calls.get_mut(call_id) {
            Some(call) => {
                call.session.answer_locally();
                call.media = Some(media);
                call.remote_ready = true;
                call.tasks.push(pump);
                call.tasks.push(timer);
                let pending = std::mem::take(&mut call.pending_ice);
                if let Some(media) = &call.media {
                    for candidate in pending {
                        if let Err(error) = media.add_remote_candidate(candidate).await {
                            debug!(call = %call_id, %error, "failed to add buffered ICE candidate");
                        }
                    }
                }
            }
            None => {
                media.close().await;
                pump.abort();
                timer.abort();
                return;
            }
        }

        let record = CallRecord::answer(call_id, &self.local, &peer, answer_sdp);
        self.write_record(call_id, &record).await;
        info!(call = %call_id, peer = %peer, "call accepted");
        let _ = self
            .events
            .send(SignalEvent::Answered {
                call_id: call_id.clone(),
                peer,
            })
            .await;
    }

    async fn reject_call(&mut self, call_id: &CallId) {
        let valid = match self.calls.get_mut(call_id) {
            Some(call) => call.session.reject_locally(),
            None => false,
        };
        if !valid {
            warn!(call = %call_id, "reject for unknown or non-ringing call");
            return;
        }
        if let Some(call) = self.teardown(call_id) {
            let record = CallRecord::reject(&self.local, call.session.peer());
            self.write_record(call_id, &record).await;
            info!(call = %call_id, peer = %call.session.peer(), "call rejected");
            let _ = self
                .events
                .send(SignalEvent::Ended {
                    call_id: call_id.clone(),
                    reason: EndReason::Rejected,
                })
                .await;
        }
    }

    async fn hang_up(&mut self, call_id: &CallId) {
        if self.calls.contains_key(call_id) {
            info!(call = %call_id, "hanging up");
            self.force_end(call_id, EndReason::LocalHangUp).await;
        } else {
            debug!(call = %call_id, "hangup for unknown call");
        }
    }

    async fn on_remote_record(&mut self, call_id: CallId, record: CallRecord) {
        // Own echoes and records aimed at other parties are not ours.
        if record.from == self.local || record.to != self.local {
            return;
        }
        if self.was_recently_ended(&call_id) {
            debug!(call = %call_id, kind = %record.kind, "record for recently ended call");
            return;
        }

        let step = self
            .calls
            .get_mut(&call_id)
            .map(|call| call.session.apply_remote(&record));
        match step {
            Some(Step::Answer(sdp)) => self.on_answered(&call_id, sdp).await,
            Some(Step::Reject) => self.on_rejected(&call_id).await,
            Some(Step::End) => self.on_remote_end(&call_id).await,
            Some(Step::Stale) => {
                debug!(call = %call_id, kind = %record.kind, "stale call record");
            }
            None => match record.kind {
                CallKind::Offer => self.on_incoming_offer(call_id, record).await,
                CallKind::End => {
                    // Terminal record for a call we no longer hold; poison
                    // later replays of the same id.
                    self.remember_ended(&call_id);
                }
                _ => {
                    debug!(call = %call_id, kind = %record.kind, "record for unknown call");
                }
            },
        }
    }

    async fn on_incoming_offer(&mut self, call_id: CallId, record: CallRecord) {
        if !self.calls.is_empty() {
            debug!(call = %call_id, from = %record.from, "busy, ignoring incoming offer");
            return;
        }
        let Some(offer_sdp) = record.offer_sdp else {
            debug!(call = %call_id, "offer record without SDP");
            return;
        };
        let is_video = record.is_video.unwrap_or(false);
        let from = record.from;

        // Candidates may trickle in while the call rings; watch now,
        // buffer until the session has a remote description.
        let tasks = vec![self.spawn_ice_watcher(&call_id).await];
        info!(call = %call_id, from = %from, is_video, "incoming call");
        self.calls.insert(
            call_id.clone(),
            ActiveCall {
                session: CallSession::callee(call_id.clone(), from.clone(), is_video, offer_sdp),
                media: None,
                pending_ice: Vec::new(),
                remote_ready: false,
                tasks,
            },
        );
        let _ = self
            .events
            .send(SignalEvent::IncomingOffer {
                call_id,
                from,
                is_video,
            })
            .await;
    }

    async fn on_answered(&mut self, call_id: &CallId, answer_sdp: String) {
        let applied = match self.calls.get(call_id) {
            Some(call) => match &call.media {
                Some(media) => media.accept_answer(&answer_sdp).await,
                None => return,
            },
            None => return,
        };
        if let Err(error) = applied {
            warn!(call = %call_id, %error, "failed to apply answer");
            self.force_end(call_id, EndReason::Failed).await;
            return;
        }

        if let Some(call) = self.calls.get_mut(call_id) {
            call.remote_ready = true;
            let pending = std::mem::take(&mut call.pending_ice);
            if let Some(media) = &call.media {
                for candidate in pending {
                    if let Err(error) = media.add_remote_candidate(candidate).await {
                        debug!(call = %call_id, %error, "failed to add buffered ICE candidate");
                    }
                }
            }
            let peer = call.session.peer().clone();
            info!(call = %call_id, peer = %peer, "call answered");
            let _ = self
                .events
                .send(SignalEvent::Answered {
                    call_id: call_id.clone(),
                    peer,
                })
                .await;
        }
    }

    /// Our offer was declined.  The rejecting side never writes the
    /// terminal record, so the offerer does.
    async fn on_rejected(&mut self, call_id: &CallId) {
        if let Some(call) = self.teardown(call_id) {
            info!(call = %call_id, peer = %call.session.peer(), "call rejected by peer");
            if let Some(media) = &call.media {
                media.close().await;
            }
            let end = CallRecord::end(&self.local, call.session.peer());
            self.write_record(call_id, &end).await;
            let _ = self
                .events
                .send(SignalEvent::Ended {
                    call_id: call_id.clone(),
                    reason: EndReason::Rejected,
                })
                .await;
        }
    }

    async fn on_remote_end(&mut self, call_id: &CallId) {
        if let Some(call) = self.teardown(call_id) {
            info!(call = %call_id, peer = %call.session.peer(), "call ended by peer");
            if let Some(media) = &call.media {
                media.close().await;
            }
            let _ = self
                .events
                .send(SignalEvent::Ended {
                    call_id: call_id.clone(),
                    reason: EndReason::RemoteHangUp,
                })
                .await;
        }
    }

    async fn on_remote_ice(&mut self, call_id: &CallId, record: IceRecord) {
        let Some(call) = self.calls.get_mut(call_id) else {
            return;
        };
        if call.remote_ready {
            if let Some(media) = &call.media {
                if let Err(error) = media.add_remote_candidate(record.candidate).await {
                    debug!(call = %call_id, %error, "failed to add ICE candidate");
                }
            }
        } else {
            call.pending_ice.push(record.candidate);
        }
    }

    async fn on_establish_tick(&mut self, call_id: &CallId) {
        let connected = match self.calls.get(call_id) {
            Some(call) => match &call.media {
                Some(media) => media.transport_connected().await,
                None => false,
            },
            None => return,
        };
        if connected {
            debug!(call = %call_id, "call established before timeout");
        } else {
            warn!(call = %call_id, "call failed to establish in time, ending");
            self.force_end(call_id, EndReason::TimedOut).await;
        }
    }

    /// Tear down, write the terminal end record, and report `reason`.
    async fn force_end(&mut self, call_id: &CallId, reason: EndReason) {
        if let Some(call) = self.teardown(call_id) {
            if let Some(media) = &call.media {
                media.close().await;
            }
            let end = CallRecord::end(&self.local, call.session.peer());
            self.write_record(call_id, &end).await;
            let _ = self
                .events
                .send(SignalEvent::Ended {
                    call_id: call_id.clone(),
                    reason,
                })
                .await;
        }
    }

    /// Remove the call, stop its helper tasks, and tombstone the id.
    fn teardown(&mut self, call_id: &CallId) -> Option<ActiveCall> {
        let call = self.calls.remove(call_id)?;
        for task in &call.tasks {
            task.abort();
        }
        self.remember_ended(call_id);
        Some(call)
    }

    fn remember_ended(&mut self, call_id: &CallId) {
        let memory = Duration::from_secs(ENDED_CALL_MEMORY_SECS);
        self.recently_ended.retain(|_, ended| ended.elapsed() < memory);
        self.recently_ended.insert(call_id.clone(), Instant::now());
    }

    fn was_recently_ended(&self, call_id: &CallId) -> bool {
        self.recently_ended
            .get(call_id)
            .map(|ended| ended.elapsed() < Duration::from_secs(ENDED_CALL_MEMORY_SECS))
            .unwrap_or(false)
    }

    async fn write_record(&self, call_id: &CallId, record: &CallRecord) {
        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(error) = self.store.put(&KeyPath::call(call_id), value).await {
                    warn!(call = %call_id, %error, "failed to write call record");
                }
            }
            Err(error) => {
                warn!(call = %call_id, %error, "call record serialization failed");
            }
        }
    }

    async fn spawn_ice_watcher(&self, call_id: &CallId) -> JoinHandle<()> {
        let mut events = self.store.watch_children(&KeyPath::call_ice(call_id)).await;
        let local = self.local.clone();
        let internal = self.internal.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.value.is_null() {
                    continue;
                }
                let record: IceRecord = match serde_json::from_value(event.value) {
                    Ok(record) => record,
                    Err(error) => {
                        debug!(call = %call_id, %error, "skipping malformed ICE record");
                        continue;
                    }
                };
                // Skip our own candidates echoed back by the store.
                if record.from == local {
                    continue;
                }
                let report = EngineInternal::RemoteIce {
                    call_id: call_id.clone(),
                    record,
                };
                if internal.send(report).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_candidate_pump(
        &self,
        call_id: &CallId,
        mut candidates: mpsc::Receiver<IceCandidate>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let local = self.local.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            let path = KeyPath::call_ice(&call_id);
            while let Some(candidate) = candidates.recv().await {
                let record = IceRecord::new(&local, candidate);
                match serde_json::to_value(&record) {
                    Ok(value) => {
                        if let Err(error) = store.append(&path, value).await {
                            warn!(call = %call_id, %error, "failed to publish ICE candidate");
                        }
                    }
                    Err(error) => {
                        warn!(call = %call_id, %error, "ICE record serialization failed");
                    }
                }
            }
        })
    }

    fn spawn_establish_timer(&self, call_id: &CallId) -> JoinHandle<()> {
        let internal = self.internal.clone();
        let timeout = self.config.establish_timeout;
        let call_id = call_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal
                .send(EngineInternal::EstablishTick { call_id })
                .await;
        })
    }

    async fn shutdown(&mut self) {
        for (call_id, call) in self.calls.drain() {
            for task in &call.tasks {
                task.abort();
            }
            if let Some(media) = &call.media {
                media.close().await;
            }
            debug!(call = %call_id, "dropping call at engine shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use causerie_store::MemoryStore;

    use crate::error::MediaError;

    // -- Fake media ---------------------------------------------------------

    struct FakeMediaSession {
        candidates: mpsc::Sender<IceCandidate>,
        applied: Mutex<Vec<IceCandidate>>,
        seen_offer: Mutex<Option<String>>,
        seen_answer: Mutex<Option<String>>,
        connected: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeMediaSession {
        async fn emit_candidate(&self, candidate: &str) {
            self.candidates
                .send(IceCandidate {
                    candidate: candidate.to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                })
                .await
                .expect("engine dropped candidate pump");
        }

        fn applied(&self) -> Vec<String> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.candidate.clone())
                .collect()
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaSession for Arc<FakeMediaSession> {
        async fn create_offer(&self) -> Result<String, MediaError> {
            Ok("v=0 fake-offer".to_string())
        }

        async fn create_answer(&self, offer_sdp: &str) -> Result<String, MediaError> {
            *self.seen_offer.lock().unwrap() = Some(offer_sdp.to_string());
            Ok("v=0 fake-answer".to_string())
        }

        async fn accept_answer(&self, answer_sdp: &str) -> Result<(), MediaError> {
            *self.seen_answer.lock().unwrap() = Some(answer_sdp.to_string());
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            self.applied.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn transport_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeMediaFactory {
        sessions: Mutex<Vec<Arc<FakeMediaSession>>>,
    }

    impl FakeMediaFactory {
        fn session(&self, index: usize) -> Arc<FakeMediaSession> {
            Arc::clone(&self.sessions.lock().unwrap()[index])
        }
    }

    #[async_trait]
    impl MediaFactory for FakeMediaFactory {
        async fn create_session(
            &self,
            _is_video: bool,
            candidates: mpsc::Sender<IceCandidate>,
        ) -> Result<Box<dyn MediaSession>, MediaError> {
            let session = Arc::new(FakeMediaSession {
                candidates,
                applied: Mutex::new(Vec::new()),
                seen_offer: Mutex::new(None),
                seen_answer: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            });
            self.sessions.lock().unwrap().push(Arc::clone(&session));
            Ok(Box::new(session))
        }
    }

    // -- Harness ------------------------------------------------------------

    fn test_config() -> EngineConfig {
        EngineConfig {
            establish_timeout: Duration::from_secs(10),
        }
    }

    /// Minimal stand-in for the server-side router: forwards every call
    /// record on the store into one engine.
    fn spawn_record_pump(
        store: Arc<dyn ReplicatedStore>,
        engine: mpsc::Sender<SignalCommand>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = store.watch_children(&KeyPath::calls()).await;
            while let Some(event) = events.recv().await {
                if event.value.is_null() {
                    continue;
                }
                let record: CallRecord = match serde_json::from_value(event.value) {
                    Ok(record) => record,
                    Err(_) => continue,
                };
                let cmd = SignalCommand::Remote {
                    call_id: CallId(event.key.clone()),
                    record,
                };
                if engine.send(cmd).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn expect_event(rx: &mut mpsc::Receiver<SignalEvent>) -> SignalEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no signal event in time")
            .expect("engine stopped")
    }

    async fn expect_quiet(rx: &mut mpsc::Receiver<SignalEvent>) {
        if let Ok(event) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
            panic!("unexpected signal event: {event:?}");
        }
    }

    async fn wait_for_record(
        store: &Arc<dyn ReplicatedStore>,
        call_id: &CallId,
        kind: CallKind,
    ) -> CallRecord {
        for _ in 0..200 {
            if let Ok(Some(value)) = store.snapshot(&KeyPath::call(call_id)).await {
                if let Ok(record) = serde_json::from_value::<CallRecord>(value) {
                    if record.kind == kind {
                        return record;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no {kind} record for call {call_id}");
    }

    async fn wait_for_call_id(store: &Arc<dyn ReplicatedStore>) -> CallId {
        for _ in 0..200 {
            if let Ok(listed) = store.children(&KeyPath::calls()).await {
                if let Some((key, _)) = listed.into_iter().next() {
                    return CallId(key);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no call record appeared");
    }

    async fn wait_for_applied(session: &Arc<FakeMediaSession>, needle: &str) {
        for _ in 0..200 {
            if session.applied().iter().any(|c| c == needle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("candidate {needle} never applied");
    }

    fn offer_record(call_id: &CallId, from: &str, to: &str) -> CallRecord {
        CallRecord::offer(
            call_id,
            &Alias::from(from),
            &Alias::from(to),
            "v=0 fake-offer".to_string(),
            false,
        )
    }

    // -- Tests --------------------------------------------------------------

    #[tokio::test]
    async fn test_start_writes_connecting_offer() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, _events) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            factory,
            test_config(),
        );

        cmd.send(SignalCommand::Start {
            peer: Alias::from("zoe"),
            video: true,
        })
        .await
        .unwrap();

        let call_id = wait_for_call_id(&store).await;
        let record = wait_for_record(&store, &call_id, CallKind::Offer).await;
        assert!(record.is_connecting_offer());
        assert_eq!(record.from, Alias::from("ada"));
        assert_eq!(record.to, Alias::from("zoe"));
        assert_eq!(record.is_video, Some(true));
        assert_eq!(record.offer_sdp.as_deref(), Some("v=0 fake-offer"));
    }

    #[tokio::test]
    async fn test_full_call_between_two_engines() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory_a = Arc::new(FakeMediaFactory::default());
        let factory_b = Arc::new(FakeMediaFactory::default());

        let (cmd_a, mut events_a) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            Arc::clone(&factory_a) as Arc<dyn MediaFactory>,
            test_config(),
        );
        let (cmd_b, mut events_b) = spawn_engine(
            Alias::from("zoe"),
            Arc::clone(&store),
            Arc::clone(&factory_b) as Arc<dyn MediaFactory>,
            test_config(),
        );
        let _pump_a = spawn_record_pump(Arc::clone(&store), cmd_a.clone());
        let _pump_b = spawn_record_pump(Arc::clone(&store), cmd_b.clone());

        // Ada calls Zoe.
        cmd_a
            .send(SignalCommand::Start {
                peer: Alias::from("zoe"),
                video: false,
            })
            .await
            .unwrap();

        let call_id = match expect_event(&mut events_b).await {
            SignalEvent::IncomingOffer {
                call_id,
                from,
                is_video,
            } => {
                assert_eq!(from, Alias::from("ada"));
                assert!(!is_video);
                call_id
            }
            other => panic!("expected incoming offer, got {other:?}"),
        };

        // Zoe accepts; both sides see the call answered.
        cmd_b
            .send(SignalCommand::Accept {
                call_id: call_id.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            expect_event(&mut events_b).await,
            SignalEvent::Answered { .. }
        ));
        assert!(matches!(
            expect_event(&mut events_a).await,
            SignalEvent::Answered { .. }
        ));

        let session_a = factory_a.session(0);
        let session_b = factory_b.session(0);
        assert_eq!(
            session_b.seen_offer.lock().unwrap().as_deref(),
            Some("v=0 fake-offer")
        );
        assert_eq!(
            session_a.seen_answer.lock().unwrap().as_deref(),
            Some("v=0 fake-answer")
        );

        // Trickle one candidate in each direction through the store.
        session_a.emit_candidate("candidate:a-1").await;
        wait_for_applied(&session_b, "candidate:a-1").await;
        session_b.emit_candidate("candidate:b-1").await;
        wait_for_applied(&session_a, "candidate:b-1").await;

        // Zoe hangs up; Ada observes the remote end.
        cmd_b
            .send(SignalCommand::HangUp {
                call_id: call_id.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            expect_event(&mut events_b).await,
            SignalEvent::Ended {
                reason: EndReason::LocalHangUp,
                ..
            }
        ));
        assert!(matches!(
            expect_event(&mut events_a).await,
            SignalEvent::Ended {
                reason: EndReason::RemoteHangUp,
                ..
            }
        ));
        assert!(session_a.closed());
        assert!(session_b.closed());

        wait_for_record(&store, &call_id, CallKind::End).await;
    }

    #[tokio::test]
    async fn test_duplicate_answer_yields_single_event() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            factory,
            test_config(),
        );

        cmd.send(SignalCommand::Start {
            peer: Alias::from("zoe"),
            video: false,
        })
        .await
        .unwrap();
        let call_id = wait_for_call_id(&store).await;

        let answer = CallRecord::answer(
            &call_id,
            &Alias::from("zoe"),
            &Alias::from("ada"),
            "v=0 fake-answer".to_string(),
        );
        for _ in 0..3 {
            cmd.send(SignalCommand::Remote {
                call_id: call_id.clone(),
                record: answer.clone(),
            })
            .await
            .unwrap();
        }

        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Answered { .. }
        ));
        expect_quiet(&mut events).await;

        // Remote hangup ends it exactly once, even when replayed.
        let end = CallRecord::end(&Alias::from("zoe"), &Alias::from("ada"));
        for _ in 0..2 {
            cmd.send(SignalCommand::Remote {
                call_id: call_id.clone(),
                record: end.clone(),
            })
            .await
            .unwrap();
        }
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Ended {
                reason: EndReason::RemoteHangUp,
                ..
            }
        ));
        expect_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_busy_node_ignores_second_offer() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("zoe"),
            Arc::clone(&store),
            factory,
            test_config(),
        );

        let first = CallId("1713200000001".to_string());
        cmd.send(SignalCommand::Remote {
            call_id: first.clone(),
            record: offer_record(&first, "ada", "zoe"),
        })
        .await
        .unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::IncomingOffer { .. }
        ));

        let second = CallId("1713200000002".to_string());
        cmd.send(SignalCommand::Remote {
            call_id: second.clone(),
            record: offer_record(&second, "eve", "zoe"),
        })
        .await
        .unwrap();
        expect_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_remote_reject_tears_down_and_writes_end() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn MediaFactory>,
            test_config(),
        );

        cmd.send(SignalCommand::Start {
            peer: Alias::from("zoe"),
            video: false,
        })
        .await
        .unwrap();
        let call_id = wait_for_call_id(&store).await;

        cmd.send(SignalCommand::Remote {
            call_id: call_id.clone(),
            record: CallRecord::reject(&Alias::from("zoe"), &Alias::from("ada")),
        })
        .await
        .unwrap();

        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Ended {
                reason: EndReason::Rejected,
                ..
            }
        ));
        // The offerer writes the terminal record on behalf of both sides.
        let record = wait_for_record(&store, &call_id, CallKind::End).await;
        assert_eq!(record.from, Alias::from("ada"));
        assert!(factory.session(0).closed());
    }

    #[tokio::test]
    async fn test_callee_reject_writes_reject_record() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("zoe"),
            Arc::clone(&store),
            factory,
            test_config(),
        );

        let call_id = CallId("1713200000001".to_string());
        cmd.send(SignalCommand::Remote {
            call_id: call_id.clone(),
            record: offer_record(&call_id, "ada", "zoe"),
        })
        .await
        .unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::IncomingOffer { .. }
        ));

        cmd.send(SignalCommand::Reject {
            call_id: call_id.clone(),
        })
        .await
        .unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Ended {
                reason: EndReason::Rejected,
                ..
            }
        ));
        let record = wait_for_record(&store, &call_id, CallKind::Reject).await;
        assert_eq!(record.from, Alias::from("zoe"));

        // A replayed copy of the original offer must not ring again.
        cmd.send(SignalCommand::Remote {
            call_id: call_id.clone(),
            record: offer_record(&call_id, "ada", "zoe"),
        })
        .await
        .unwrap();
        expect_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_ice_buffered_while_ringing_flushes_in_order() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("zoe"),
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn MediaFactory>,
            test_config(),
        );

        let call_id = CallId("1713200000001".to_string());
        cmd.send(SignalCommand::Remote {
            call_id: call_id.clone(),
            record: offer_record(&call_id, "ada", "zoe"),
        })
        .await
        .unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::IncomingOffer { .. }
        ));

        // Caller candidates arrive while the call is still ringing.
        let ice_path = KeyPath::call_ice(&call_id);
        for name in ["candidate:early-1", "candidate:early-2"] {
            let record = IceRecord::new(
                &Alias::from("ada"),
                IceCandidate {
                    candidate: name.to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                },
            );
            store
                .append(&ice_path, serde_json::to_value(&record).unwrap())
                .await
                .unwrap();
        }
        // Our own echoed candidate must be filtered out, not buffered.
        let own = IceRecord::new(
            &Alias::from("zoe"),
            IceCandidate {
                candidate: "candidate:own-echo".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
        );
        store
            .append(&ice_path, serde_json::to_value(&own).unwrap())
            .await
            .unwrap();

        cmd.send(SignalCommand::Accept {
            call_id: call_id.clone(),
        })
        .await
        .unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Answered { .. }
        ));

        let session = factory.session(0);
        wait_for_applied(&session, "candidate:early-2").await;
        assert_eq!(
            session.applied(),
            vec!["candidate:early-1".to_string(), "candidate:early-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unestablished_call_times_out() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn MediaFactory>,
            EngineConfig {
                establish_timeout: Duration::from_millis(50),
            },
        );

        cmd.send(SignalCommand::Start {
            peer: Alias::from("zoe"),
            video: false,
        })
        .await
        .unwrap();
        let call_id = wait_for_call_id(&store).await;

        assert!(matches!(
            expect_event(&mut events).await,
            SignalEvent::Ended {
                reason: EndReason::TimedOut,
                ..
            }
        ));
        wait_for_record(&store, &call_id, CallKind::End).await;
        assert!(factory.session(0).closed());
    }

    #[tokio::test]
    async fn test_established_call_survives_timer() {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeMediaFactory::default());
        let (cmd, mut events) = spawn_engine(
            Alias::from("ada"),
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn MediaFactory>,
            EngineConfig {
                establish_timeout: Duration::from_millis(50),
            },
        );

        cmd.send(SignalCommand::Start {
            peer: Alias::from("zoe"),
            video: false,
        })
        .await
        .unwrap();
        wait_for_call_id(&store).await;
        factory.session(0).connected.store(true, Ordering::SeqCst);

        // The timer fires but the connected transport keeps the call up.
        expect_quiet(&mut events).await;
        assert!(!factory.session(0).closed());
    }
}
