//! Session runtime: the per-session aggregate, its pure state reducer, and
//! the repository that persists it.

pub mod history;
pub mod identity;
pub mod outbound;
pub mod ratelimit;
pub mod reducer;
pub mod registry;
pub mod session;
pub mod session_id;
pub mod store;
pub mod team;

pub use history::{MessageHistory, Sequencer};
pub use identity::ConsumerIdentity;
pub use outbound::{ClosedReason, Enqueue, OutboundQueue};
pub use ratelimit::TokenBucket;
pub use registry::{CommandRegistry, CommandSource};
pub use session::{ConsumerHandle, ConsumerId, Session, SessionLimits, SessionPhase};
pub use store::{FileSessionStorage, SessionRepository, SessionSnapshot, SessionStorage};
