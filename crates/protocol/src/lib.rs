//! Consumer wire protocol: the newline-delimited JSON frames exchanged with
//! browsers, mobile apps, and automation clients.
//!
//! Inbound frames are a closed set discriminated by `type`; outbound frames
//! are wrapped in a [`SequencedMessage`] so consumers can detect gaps and
//! request replay after a reconnect.

mod inbound;
mod outbound;

pub use inbound::{parse_request, ConsumerRequest};
pub use outbound::{ConsumerEvent, PresenceEntry, SessionActivity};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a connected consumer may do. Observers are read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerRole {
    #[default]
    Participant,
    Observer,
}

/// Role-based authorization: observers may only query presence.
pub fn authorized(role: ConsumerRole, request: &ConsumerRequest) -> bool {
    match role {
        ConsumerRole::Participant => true,
        ConsumerRole::Observer => matches!(request, ConsumerRequest::PresenceQuery),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequenced envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound envelope. `seq` is session-global and strictly monotonic from 1;
/// `message_id` is unique within the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedMessage<T> {
    pub seq: u64,
    pub message_id: Uuid,
    #[serde(flatten)]
    pub payload: T,
}

pub type SequencedEvent = SequencedMessage<ConsumerEvent>;

impl SequencedEvent {
    pub fn new(seq: u64, payload: ConsumerEvent) -> Self {
        Self {
            seq,
            message_id: Uuid::new_v4(),
            payload,
        }
    }
}
