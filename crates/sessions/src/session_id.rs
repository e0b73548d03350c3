//! Session id validation.
//!
//! Session ids are UUID-shaped and validated at every boundary: WebSocket
//! paths, the daemon API, and storage filenames.

use std::sync::OnceLock;

use regex::Regex;

static PATTERN: OnceLock<Regex> = OnceLock::new();

fn pattern() -> &'static Regex {
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new("^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

pub fn is_valid(id: &str) -> bool {
    pattern().is_match(id)
}

/// Mint a new session id.
pub fn generate() -> String {
    uuid::Uuid::new_v4().to_string()
}
