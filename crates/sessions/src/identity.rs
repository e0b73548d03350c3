//! Consumer identities.
//!
//! An identity is produced by the configured authenticator, or allocated
//! anonymously when none is configured. Its lifetime is bound to one socket.

use bc_protocol::{ConsumerRole, PresenceEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: ConsumerRole,
}

impl ConsumerIdentity {
    /// Anonymous identity `n`. Observer mode is inert without an
    /// authenticator, so anonymous consumers are always participants.
    pub fn anonymous(n: u64) -> Self {
        Self {
            user_id: format!("anonymous-{n}"),
            display_name: format!("User {n}"),
            role: ConsumerRole::Participant,
        }
    }

    pub fn presence_entry(&self) -> PresenceEntry {
        PresenceEntry {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
        }
    }
}
