//! The per-session aggregate.
//!
//! One `Session` owns every piece of per-session mutable state; everything
//! else in the broker goes through these accessors. Locks are per-field so
//! the router, gateways, and policies never contend on one big mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use bc_adapters::BackendChannel;
use bc_domain::message::PermissionRequest;
use bc_domain::state::{QueuedMessage, SessionState, SessionStatus};
use bc_protocol::PresenceEntry;

use crate::history::{MessageHistory, Sequencer};
use crate::identity::ConsumerIdentity;
use crate::outbound::OutboundQueue;
use crate::ratelimit::TokenBucket;
use crate::registry::CommandRegistry;
use crate::team::CorrelationBuffer;

pub type ConsumerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created; waiting for the backend to attach (or dial in).
    Starting,
    Running,
    Closed,
}

/// Per-session knobs, derived from config at session creation.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_history: usize,
    pub initial_replay: usize,
    pub pending_message_max: usize,
    pub high_water_mark: usize,
    pub max_queue_size: usize,
    pub rate_burst: u32,
    pub rate_refill_per_sec: f64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_history: 500,
            initial_replay: 20,
            pending_message_max: 64,
            high_water_mark: 1000,
            max_queue_size: 5000,
            rate_burst: 30,
            rate_refill_per_sec: 10.0,
        }
    }
}

/// The live backend attachment: the outbound channel, the cancellation
/// token that stops its inbound pump, and the pump task itself (installed
/// right after the pump is spawned).
pub struct BackendHandle {
    pub channel: Arc<dyn BackendChannel>,
    pub cancel: CancellationToken,
    pub pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackendHandle {
    pub fn new(channel: Arc<dyn BackendChannel>, cancel: CancellationToken) -> Self {
        Self {
            channel,
            cancel,
            pump: Mutex::new(None),
        }
    }
}

/// One connected consumer socket: identity, rate limiter, outbound queue.
/// All three are created and released together.
pub struct ConsumerHandle {
    pub identity: ConsumerIdentity,
    pub limiter: Mutex<TokenBucket>,
    pub queue: Arc<OutboundQueue>,
}

/// The in-flight initialize handshake. Aborting the timer task cancels the
/// timeout.
pub struct PendingInitialize {
    pub request_id: String,
    pub timer: tokio::task::JoinHandle<()>,
}

/// A slash command forwarded to the backend as a user message, awaiting its
/// echoed response. `response` accumulates assistant text until the turn's
/// result tags it back to the original request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPassthrough {
    pub command: String,
    pub request_id: Option<String>,
    pub response: String,
}

pub struct Session {
    id: String,
    limits: SessionLimits,
    adapter_name: RwLock<String>,
    phase: RwLock<SessionPhase>,
    archived: AtomicBool,
    state: RwLock<SessionState>,
    history: Mutex<MessageHistory>,
    sequencer: Mutex<Sequencer>,
    pending_permissions: Mutex<HashMap<String, PermissionRequest>>,
    pending_messages: Mutex<VecDeque<String>>,
    queued_message: Mutex<Option<QueuedMessage>>,
    last_status: Mutex<Option<SessionStatus>>,
    pending_initialize: Mutex<Option<PendingInitialize>>,
    pending_passthroughs: Mutex<VecDeque<PendingPassthrough>>,
    consumers: RwLock<HashMap<ConsumerId, Arc<ConsumerHandle>>>,
    next_consumer_id: AtomicU64,
    /// Consumer user id → highest seq delivered, for replay on reconnect.
    last_seen: Mutex<HashMap<String, u64>>,
    team_buffer: Mutex<CorrelationBuffer>,
    registry: Mutex<CommandRegistry>,
    backend: Mutex<Option<BackendHandle>>,
    /// The backend's own conversation id from the latest `session_init`;
    /// a different id on a later init marks a genuinely new conversation.
    backend_session_id: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, adapter_name: impl Into<String>, limits: SessionLimits) -> Self {
        let id = id.into();
        Self {
            state: RwLock::new(SessionState::new(id.clone())),
            history: Mutex::new(MessageHistory::new(limits.max_history)),
            sequencer: Mutex::new(Sequencer::new()),
            pending_permissions: Mutex::new(HashMap::new()),
            pending_messages: Mutex::new(VecDeque::new()),
            queued_message: Mutex::new(None),
            last_status: Mutex::new(None),
            pending_initialize: Mutex::new(None),
            pending_passthroughs: Mutex::new(VecDeque::new()),
            consumers: RwLock::new(HashMap::new()),
            next_consumer_id: AtomicU64::new(1),
            last_seen: Mutex::new(HashMap::new()),
            team_buffer: Mutex::new(CorrelationBuffer::new()),
            registry: Mutex::new(CommandRegistry::new()),
            backend: Mutex::new(None),
            backend_session_id: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            adapter_name: RwLock::new(adapter_name.into()),
            phase: RwLock::new(SessionPhase::Starting),
            archived: AtomicBool::new(false),
            limits,
            id,
        }
    }

    // ── Identity & lifecycle ─────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn adapter_name(&self) -> String {
        self.adapter_name.read().clone()
    }

    /// Only meaningful before the backend attaches; the gateway enforces that.
    pub fn set_adapter_name(&self, name: impl Into<String>) {
        *self.adapter_name.write() = name.into();
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::Relaxed)
    }

    pub fn set_archived(&self, archived: bool) {
        self.archived.store(archived, Ordering::Relaxed);
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Run the reducer-style closure against the current state; stores and
    /// reports true when it returned a replacement.
    pub fn update_state<F>(&self, f: F) -> bool
    where
        F: FnOnce(&SessionState, &mut CorrelationBuffer) -> Option<SessionState>,
    {
        let mut buffer = self.team_buffer.lock();
        let mut state = self.state.write();
        match f(&state, &mut buffer) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        }
    }

    // ── Sequencing & history ─────────────────────────────────────────

    pub fn next_seq(&self) -> u64 {
        self.sequencer.lock().next()
    }

    pub fn current_seq(&self) -> u64 {
        self.sequencer.lock().current()
    }

    /// Reset sequencing and history on session re-initialization.
    pub fn reset_sequencer(&self) {
        self.sequencer.lock().reset();
        self.history.lock().clear();
        self.last_seen.lock().clear();
    }

    pub fn push_history(&self, event: bc_protocol::SequencedEvent) {
        self.history.lock().push(event);
    }

    pub fn replay_after(&self, seq: u64) -> Vec<bc_protocol::SequencedEvent> {
        self.history.lock().replay_after(seq)
    }

    pub fn history_tail(&self, n: usize) -> Vec<bc_protocol::SequencedEvent> {
        self.history.lock().tail(n)
    }

    pub fn history_snapshot(&self) -> Vec<bc_protocol::SequencedEvent> {
        self.history.lock().entries().cloned().collect()
    }

    pub fn restore_history(&self, entries: Vec<bc_protocol::SequencedEvent>) {
        let mut history = self.history.lock();
        *history = MessageHistory::restore(self.limits.max_history, entries);
        // Keep the sequencer ahead of everything already handed out.
        let mut sequencer = self.sequencer.lock();
        while sequencer.current() < history.last_seq() {
            sequencer.next();
        }
    }

    // ── Pending permissions ──────────────────────────────────────────

    pub fn insert_permission(&self, request: PermissionRequest) {
        self.pending_permissions
            .lock()
            .insert(request.request_id.clone(), request);
    }

    pub fn remove_permission(&self, request_id: &str) -> Option<PermissionRequest> {
        self.pending_permissions.lock().remove(request_id)
    }

    /// Remove and return every pending permission (session close).
    pub fn drain_permissions(&self) -> Vec<PermissionRequest> {
        let mut drained: Vec<PermissionRequest> =
            self.pending_permissions.lock().drain().map(|(_, v)| v).collect();
        drained.sort_by_key(|p| p.timestamp);
        drained
    }

    pub fn pending_permission_count(&self) -> usize {
        self.pending_permissions.lock().len()
    }

    pub fn permissions_snapshot(&self) -> Vec<(String, PermissionRequest)> {
        let mut pairs: Vec<(String, PermissionRequest)> = self
            .pending_permissions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));
        pairs
    }

    pub fn restore_permissions(&self, pairs: Vec<(String, PermissionRequest)>) {
        let mut pending = self.pending_permissions.lock();
        for (key, request) in pairs {
            pending.insert(key, request);
        }
    }

    // ── Pending (buffered) outbound messages ─────────────────────────

    /// Buffer a user message while the backend is away; oldest drops when
    /// the queue is full.
    pub fn push_pending_message(&self, content: String) {
        let mut pending = self.pending_messages.lock();
        if pending.len() == self.limits.pending_message_max {
            pending.pop_front();
        }
        pending.push_back(content);
    }

    pub fn drain_pending_messages(&self) -> Vec<String> {
        self.pending_messages.lock().drain(..).collect()
    }

    pub fn pending_message_count(&self) -> usize {
        self.pending_messages.lock().len()
    }

    pub fn pending_messages_snapshot(&self) -> Vec<String> {
        self.pending_messages.lock().iter().cloned().collect()
    }

    pub fn restore_pending_messages(&self, messages: Vec<String>) {
        let mut pending = self.pending_messages.lock();
        for message in messages {
            if pending.len() == self.limits.pending_message_max {
                pending.pop_front();
            }
            pending.push_back(message);
        }
    }

    // ── Queued message slot ──────────────────────────────────────────

    pub fn set_queued_message(&self, queued: QueuedMessage) {
        *self.queued_message.lock() = Some(queued);
    }

    pub fn take_queued_message(&self) -> Option<QueuedMessage> {
        self.queued_message.lock().take()
    }

    pub fn clear_queued_message(&self) -> bool {
        self.queued_message.lock().take().is_some()
    }

    pub fn queued_message(&self) -> Option<QueuedMessage> {
        self.queued_message.lock().clone()
    }

    // ── Status ───────────────────────────────────────────────────────

    pub fn last_status(&self) -> Option<SessionStatus> {
        *self.last_status.lock()
    }

    pub fn set_last_status(&self, status: Option<SessionStatus>) {
        *self.last_status.lock() = status;
    }

    // ── Initialize handshake slot ────────────────────────────────────

    /// Install the pending initialize. Returns false (and aborts the new
    /// timer) when one is already outstanding.
    pub fn set_pending_initialize(&self, pending: PendingInitialize) -> bool {
        let mut slot = self.pending_initialize.lock();
        if slot.is_some() {
            pending.timer.abort();
            return false;
        }
        *slot = Some(pending);
        true
    }

    /// Take the slot if the request id matches.
    pub fn take_pending_initialize(&self, request_id: &str) -> Option<PendingInitialize> {
        let mut slot = self.pending_initialize.lock();
        if slot.as_ref().map(|p| p.request_id.as_str()) == Some(request_id) {
            slot.take()
        } else {
            None
        }
    }

    /// Clear unconditionally (timeout or session close); safe to repeat.
    pub fn clear_pending_initialize(&self) -> Option<PendingInitialize> {
        self.pending_initialize.lock().take()
    }

    pub fn has_pending_initialize(&self) -> bool {
        self.pending_initialize.lock().is_some()
    }

    // ── Passthrough FIFO ─────────────────────────────────────────────

    pub fn push_passthrough(&self, pending: PendingPassthrough) {
        self.pending_passthroughs.lock().push_back(pending);
    }

    pub fn pop_passthrough(&self) -> Option<PendingPassthrough> {
        self.pending_passthroughs.lock().pop_front()
    }

    pub fn has_pending_passthrough(&self) -> bool {
        !self.pending_passthroughs.lock().is_empty()
    }

    /// Fold assistant text into the oldest pending passthrough.
    pub fn append_passthrough_response(&self, text: &str) {
        if let Some(front) = self.pending_passthroughs.lock().front_mut() {
            if !front.response.is_empty() {
                front.response.push('\n');
            }
            front.response.push_str(text);
        }
    }

    // ── Consumers ────────────────────────────────────────────────────

    /// Register a consumer socket; creates its rate limiter and outbound
    /// queue with it.
    pub fn add_consumer(&self, identity: ConsumerIdentity) -> (ConsumerId, Arc<ConsumerHandle>) {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConsumerHandle {
            identity,
            limiter: Mutex::new(TokenBucket::new(
                self.limits.rate_burst,
                self.limits.rate_refill_per_sec,
            )),
            queue: Arc::new(OutboundQueue::new(
                self.limits.high_water_mark,
                self.limits.max_queue_size,
            )),
        });
        self.consumers.write().insert(id, handle.clone());
        (id, handle)
    }

    pub fn remove_consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerHandle>> {
        self.consumers.write().remove(&id)
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerHandle>> {
        self.consumers.read().get(&id).cloned()
    }

    pub fn consumers(&self) -> Vec<(ConsumerId, Arc<ConsumerHandle>)> {
        self.consumers
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .consumers
            .read()
            .values()
            .map(|h| h.identity.presence_entry())
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn last_seen_for(&self, user_id: &str) -> Option<u64> {
        self.last_seen.lock().get(user_id).copied()
    }

    pub fn record_seen(&self, user_id: &str, seq: u64) {
        let mut seen = self.last_seen.lock();
        let entry = seen.entry(user_id.to_string()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    // ── Registry & team buffer ───────────────────────────────────────

    pub fn with_registry<R>(&self, f: impl FnOnce(&mut CommandRegistry) -> R) -> R {
        f(&mut self.registry.lock())
    }

    // ── Backend handle ───────────────────────────────────────────────

    pub fn set_backend(&self, handle: BackendHandle) {
        *self.backend.lock() = Some(handle);
    }

    pub fn take_backend(&self) -> Option<BackendHandle> {
        self.backend.lock().take()
    }

    pub fn backend_channel(&self) -> Option<Arc<dyn BackendChannel>> {
        self.backend.lock().as_ref().map(|h| h.channel.clone())
    }

    /// Attach the pump task to the current backend handle.
    pub fn set_backend_pump(&self, pump: tokio::task::JoinHandle<()>) {
        if let Some(handle) = self.backend.lock().as_ref() {
            *handle.pump.lock() = Some(pump);
        } else {
            pump.abort();
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.lock().is_some()
    }

    /// Swap in the backend conversation id; returns the previous one.
    pub fn swap_backend_session_id(&self, id: impl Into<String>) -> Option<String> {
        self.backend_session_id.lock().replace(id.into())
    }

    // ── Activity ─────────────────────────────────────────────────────

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_protocol::{ConsumerEvent, SequencedEvent};
    use chrono::Utc;

    fn session() -> Session {
        Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "claude",
            SessionLimits::default(),
        )
    }

    fn permission(request_id: &str) -> PermissionRequest {
        PermissionRequest {
            request_id: request_id.into(),
            tool_name: "Bash".into(),
            tool_call_id: None,
            input: serde_json::Value::Null,
            timestamp: Utc::now(),
            hints: serde_json::Map::new(),
        }
    }

    #[test]
    fn consumer_gets_limiter_and_queue_together() {
        let session = session();
        let (id, handle) = session.add_consumer(ConsumerIdentity::anonymous(1));
        assert_eq!(session.consumer_count(), 1);
        assert!(handle.queue.is_empty());
        assert!(handle.limiter.lock().try_consume(1));

        let removed = session.remove_consumer(id).unwrap();
        assert_eq!(removed.identity.user_id, "anonymous-1");
        assert_eq!(session.consumer_count(), 0);
    }

    #[test]
    fn permission_keys_match_request_ids() {
        let session = session();
        session.insert_permission(permission("r1"));
        session.insert_permission(permission("r2"));
        for (key, request) in session.permissions_snapshot() {
            assert_eq!(key, request.request_id);
        }
        assert!(session.remove_permission("r1").is_some());
        assert!(session.remove_permission("r1").is_none());
        assert_eq!(session.drain_permissions().len(), 1);
        assert_eq!(session.pending_permission_count(), 0);
    }

    #[test]
    fn pending_messages_drop_oldest_at_cap() {
        let limits = SessionLimits {
            pending_message_max: 3,
            ..Default::default()
        };
        let session = Session::new("id", "claude", limits);
        for i in 0..5 {
            session.push_pending_message(format!("m{i}"));
        }
        assert_eq!(session.drain_pending_messages(), vec!["m2", "m3", "m4"]);
        assert_eq!(session.pending_message_count(), 0);
    }

    #[test]
    fn single_pending_initialize_slot() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let session = session();
            let timer = tokio::spawn(async {});
            assert!(session.set_pending_initialize(PendingInitialize {
                request_id: "a".into(),
                timer,
            }));

            let timer = tokio::spawn(async {});
            assert!(!session.set_pending_initialize(PendingInitialize {
                request_id: "b".into(),
                timer,
            }));

            // Mismatched id does not take the slot.
            assert!(session.take_pending_initialize("b").is_none());
            assert!(session.take_pending_initialize("a").is_some());
            assert!(!session.has_pending_initialize());

            // Clearing an empty slot is fine.
            assert!(session.clear_pending_initialize().is_none());
        });
    }

    #[test]
    fn restore_history_keeps_sequencer_ahead() {
        let session = session();
        let entries = vec![
            SequencedEvent::new(1, ConsumerEvent::CliConnected),
            SequencedEvent::new(7, ConsumerEvent::CliDisconnected),
        ];
        session.restore_history(entries);
        assert_eq!(session.next_seq(), 8);
    }

    #[test]
    fn reset_clears_sequencing_and_replay_state() {
        let session = session();
        let seq = session.next_seq();
        session.push_history(SequencedEvent::new(seq, ConsumerEvent::CliConnected));
        session.record_seen("u1", seq);

        session.reset_sequencer();
        assert_eq!(session.next_seq(), 1);
        assert!(session.replay_after(0).is_empty());
        assert!(session.last_seen_for("u1").is_none());
    }

    #[test]
    fn record_seen_never_regresses() {
        let session = session();
        session.record_seen("u1", 10);
        session.record_seen("u1", 5);
        assert_eq!(session.last_seen_for("u1"), Some(10));
    }
}
