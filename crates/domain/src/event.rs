//! Typed domain events and the process-wide event bus.
//!
//! Control loops (reconnect watchdog, idle reaper) and the coordinator
//! subscribe here rather than holding references into each other.

use tokio::sync::broadcast;

/// The closed set of domain events. `key()` gives the stable event name.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    SessionCreated {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    BackendConnected {
        session_id: String,
    },
    BackendDisconnected {
        session_id: String,
    },
    ProcessConnected {
        session_id: String,
    },
    ProcessExited {
        session_id: String,
        exit_code: Option<i32>,
        uptime_ms: u64,
    },
    CapabilitiesReady {
        session_id: String,
        commands: usize,
        models: usize,
    },
    CapabilitiesTimeout {
        session_id: String,
    },
    SlashExecuted {
        session_id: String,
        command: String,
        duration_ms: u64,
        source: String,
    },
    SlashFailed {
        session_id: String,
        command: String,
    },
    RateLimitExceeded {
        session_id: String,
        user_id: String,
    },
}

impl DomainEvent {
    pub fn key(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session:created",
            Self::SessionClosed { .. } => "session:closed",
            Self::BackendConnected { .. } => "backend:connected",
            Self::BackendDisconnected { .. } => "backend:disconnected",
            Self::ProcessConnected { .. } => "process:connected",
            Self::ProcessExited { .. } => "process:exited",
            Self::CapabilitiesReady { .. } => "capabilities:ready",
            Self::CapabilitiesTimeout { .. } => "capabilities:timeout",
            Self::SlashExecuted { .. } => "slash_command:executed",
            Self::SlashFailed { .. } => "slash_command:failed",
            Self::RateLimitExceeded { .. } => "ratelimit:exceeded",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session_id }
            | Self::SessionClosed { session_id }
            | Self::BackendConnected { session_id }
            | Self::BackendDisconnected { session_id }
            | Self::ProcessConnected { session_id }
            | Self::ProcessExited { session_id, .. }
            | Self::CapabilitiesReady { session_id, .. }
            | Self::CapabilitiesTimeout { session_id }
            | Self::SlashExecuted { session_id, .. }
            | Self::SlashFailed { session_id, .. }
            | Self::RateLimitExceeded { session_id, .. } => session_id,
        }
    }
}

/// Broadcast fan-out for domain events. Emitting never blocks; events are
/// dropped for subscribers that lag behind the channel capacity.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: DomainEvent) {
        tracing::debug!(
            event = event.key(),
            session_id = event.session_id(),
            "domain event"
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(DomainEvent::SessionCreated {
            session_id: "s1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key(), "session:created");
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn emit_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.emit(DomainEvent::SessionClosed {
            session_id: "s1".into(),
        });
    }
}
