//! Backend adapters: one module per agent protocol, all normalizing to the
//! [`bc_domain::UnifiedMessage`] stream.
//!
//! Adapters are pure translators. They map user-originated messages to their
//! wire form and wire events back to `UnifiedMessage` (or drop them); all
//! state mutation happens downstream in the core reducer.

pub mod acp;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod ndjson;
pub mod opencode;
pub mod registry;
pub mod rendezvous;
mod sse;
pub mod traits;

pub use registry::AdapterResolver;
pub use rendezvous::{CliSocket, SocketRegistry};
pub use traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, SlashExecutor, SlashOutcome,
};
