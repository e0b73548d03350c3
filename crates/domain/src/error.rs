/// Shared error type used across all BeamCode crates.
///
/// Variants are grouped by layer (transport, protocol, auth, session,
/// adapter, capacity, storage). Each carries a stable machine-readable tag
/// via [`Error::kind`] so gateways can surface it on the wire without
/// leaking `Display` formatting into the protocol.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Transport ────────────────────────────────────────────────────
    #[error("socket closed")]
    SocketClosed,

    #[error("payload too large: {actual} bytes (limit {limit})")]
    PayloadTooLarge { limit: usize, actual: usize },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("origin not allowed: {0}")]
    BadOrigin(String),

    // ── Protocol ─────────────────────────────────────────────────────
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    // ── Auth ─────────────────────────────────────────────────────────
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited,

    // ── Session ──────────────────────────────────────────────────────
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session closed")]
    SessionClosed,

    #[error("backend disconnected")]
    BackendDisconnected,

    // ── Adapter ──────────────────────────────────────────────────────
    #[error("adapter {adapter}: connect failed: {message}")]
    ConnectFailed { adapter: String, message: String },

    #[error("adapter {adapter}: handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { adapter: String, timeout_ms: u64 },

    #[error("translate: {0}")]
    TranslateError(String),

    // ── Capacity ─────────────────────────────────────────────────────
    #[error("max sessions reached ({limit})")]
    MaxSessionsReached { limit: usize },

    #[error("outbound queue overflow")]
    QueueOverflow,

    // ── Storage ──────────────────────────────────────────────────────
    #[error("persistence IO: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable snake_case tag for wire errors and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SocketClosed => "socket_closed",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidPath(_) => "invalid_path",
            Self::BadOrigin(_) => "bad_origin",
            Self::InvalidFrame(_) => "invalid_frame",
            Self::SchemaViolation(_) => "schema_violation",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::Unsupported(_) => "unsupported",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::UnknownSession(_) => "unknown_session",
            Self::SessionClosed => "session_closed",
            Self::BackendDisconnected => "backend_disconnected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::TranslateError(_) => "translate_error",
            Self::MaxSessionsReached { .. } => "max_sessions_reached",
            Self::QueueOverflow => "queue_overflow",
            Self::Persistence(_) => "persistence_io_error",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_snake_case() {
        let err = Error::ConnectFailed {
            adapter: "codex".into(),
            message: "spawn failed".into(),
        };
        assert_eq!(err.kind(), "connect_failed");
        assert_eq!(Error::RateLimited.kind(), "rate_limited");
    }
}
