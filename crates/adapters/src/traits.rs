//! The contract every backend adapter satisfies.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};
use bc_domain::message::UnifiedMessage;

use crate::rendezvous::CliSocket;

/// Capacity of the inbound message channel each adapter session owns.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities & options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Local,
    Remote,
    Both,
}

/// What a backend protocol can do. The core consults this before sending
/// work an adapter cannot express.
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    /// Whether unrecognized slash commands may be forwarded as user messages.
    pub slash_commands: bool,
    pub availability: Availability,
    pub teams: bool,
}

/// Options for opening an adapter session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub session_id: String,
    /// Resume an existing backend conversation rather than starting fresh.
    pub resume: bool,
    pub cwd: Option<PathBuf>,
    pub adapter_options: Map<String, Value>,
}

impl ConnectOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            resume: false,
            cwd: None,
            adapter_options: Map::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session & channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The outbound half of an adapter session.
#[async_trait::async_trait]
pub trait BackendChannel: Send + Sync {
    /// Translate and send one message. Fails with `SessionClosed` after close.
    async fn send(&self, msg: UnifiedMessage) -> Result<()>;

    /// Send a raw NDJSON line. Only adapters whose translator speaks NDJSON
    /// support this; the rest report `Unsupported`.
    async fn send_raw(&self, _line: String) -> Result<()> {
        Err(Error::Unsupported("raw NDJSON"))
    }

    /// Idempotent. Releases transport resources and ends the inbound stream.
    async fn close(&self);
}

/// A live adapter session.
///
/// `messages` is the finite inbound stream: the adapter's reader task pushes
/// translated messages until the transport ends (pushing a synthetic failed
/// `result` first on abnormal loss), then drops the sender. It is not
/// restartable; reconnecting means a fresh `connect`.
pub struct BackendSession {
    pub session_id: String,
    pub channel: Arc<dyn BackendChannel>,
    pub messages: mpsc::Receiver<UnifiedMessage>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slash execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A command the adapter can run natively (outside the prompt stream).
#[derive(Debug, Clone)]
pub struct SlashOutcome {
    pub content: String,
    /// Always `"emulated"` for adapter-native execution.
    pub source: &'static str,
    pub duration_ms: u64,
}

/// Adapter-native slash command executor.
#[async_trait::async_trait]
pub trait SlashExecutor: Send + Sync {
    fn handles(&self, command: &str) -> bool;

    /// Run the command. `Ok(None)` means the executor declined after all.
    async fn execute(&self, command: &str) -> Result<Option<SlashOutcome>>;

    fn supported_commands(&self) -> Vec<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Open a session. May block on the protocol handshake; fails with
    /// `ConnectFailed`, `HandshakeTimeout`, or `SessionClosed` (exit before
    /// ready). The returned session's id always equals `opts.session_id`.
    async fn connect(&self, opts: ConnectOptions) -> Result<BackendSession>;

    /// Native slash executor bound to an open channel, if the protocol has one.
    fn slash_executor(&self, _channel: Arc<dyn BackendChannel>) -> Option<Box<dyn SlashExecutor>> {
        None
    }

    /// Inverted adapters accept CLI dial-ins instead of dialing out.
    fn is_inverted(&self) -> bool {
        false
    }

    /// Hand a dialed-in CLI socket to a pending `connect`. Returns false when
    /// no connect is waiting for this session.
    fn deliver_socket(&self, _session_id: &str, _socket: CliSocket) -> bool {
        false
    }

    /// Abort a pending inverted `connect` for this session.
    fn cancel_pending(&self, _session_id: &str) {}
}
