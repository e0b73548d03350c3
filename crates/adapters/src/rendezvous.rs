//! Rendezvous table for inverted connections.
//!
//! Inverted adapters wait in `connect` for the CLI to dial the broker. The
//! registry holds one pending resolver per session id; the CLI gateway calls
//! [`SocketRegistry::deliver`] when the matching dial-in arrives.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use bc_domain::error::{Error, Result};

/// A dialed-in CLI connection, reduced to line channels so adapters stay
/// transport-agnostic. Frames received before the adapter starts reading sit
/// in the bounded `incoming` channel and are replayed in arrival order.
#[derive(Debug)]
pub struct CliSocket {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// How many inbound frames may buffer before the dial-in is throttled.
pub const CLI_SOCKET_BUFFER: usize = 256;

#[derive(Debug)]
struct PendingSocket {
    tx: oneshot::Sender<CliSocket>,
}

/// Pending `register` entries keyed by session id.
#[derive(Debug)]
pub struct SocketRegistry {
    pending: Mutex<HashMap<String, PendingSocket>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wait up to `timeout` for a CLI socket for `session_id`.
    ///
    /// A second `register` for the same id supersedes the first (the earlier
    /// waiter fails as cancelled).
    pub async fn register(
        &self,
        adapter: &str,
        session_id: &str,
        timeout: Duration,
    ) -> Result<CliSocket> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending
                .insert(session_id.to_string(), PendingSocket { tx })
                .is_some()
            {
                tracing::warn!(session_id, "superseding pending CLI rendezvous");
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(_)) => Err(Error::ConnectFailed {
                adapter: adapter.to_string(),
                message: "pending CLI dial-in was cancelled".into(),
            }),
            Err(_) => {
                self.pending.lock().remove(session_id);
                Err(Error::HandshakeTimeout {
                    adapter: adapter.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Resolve a pending `register` with the dialed-in socket. Returns false
    /// when nothing is waiting for this session.
    pub fn deliver(&self, session_id: &str, socket: CliSocket) -> bool {
        let entry = self.pending.lock().remove(session_id);
        match entry {
            Some(pending) => pending.tx.send(socket).is_ok(),
            None => false,
        }
    }

    /// Abort a pending `register`. The waiter fails with `ConnectFailed`.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.pending.lock().remove(session_id).is_some()
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.lock().contains_key(session_id)
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
