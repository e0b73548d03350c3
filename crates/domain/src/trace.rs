use serde::Serialize;

/// Structured trace events emitted across all BeamCode crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
        adapter: String,
    },
    SessionRestored {
        count: usize,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },
    MessageRouted {
        session_id: String,
        message_type: String,
    },
    BackendConnected {
        session_id: String,
        adapter: String,
    },
    BackendDisconnected {
        session_id: String,
    },
    ConsumerJoined {
        session_id: String,
        user_id: String,
    },
    ConsumerLeft {
        session_id: String,
        user_id: String,
    },
    ReplaySent {
        session_id: String,
        after_seq: u64,
        count: usize,
    },
    MessagesShed {
        session_id: String,
        user_id: String,
        count: usize,
    },
    PersistenceFlush {
        session_id: String,
        bytes: usize,
    },
    WatchdogFired {
        session_id: String,
        relaunched: bool,
    },
    ProcessSpawned {
        session_id: String,
        pid: u32,
    },
    ProcessKilled {
        session_id: String,
        pid: u32,
        forced: bool,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "bc_event");
    }
}
