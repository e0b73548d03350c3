//! Shared application state passed to all HTTP/WS handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bc_domain::config::Config;
use bc_sessions::ConsumerIdentity;

use crate::auth::{token_hash, ConsumerAuthenticator, TokenAuthenticator};
use crate::coordinator::Coordinator;
use crate::origin::OriginValidator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<Config>,
    pub origin: Arc<OriginValidator>,
    /// `None` = dev mode: anonymous consumers, open control API.
    pub authenticator: Option<Arc<dyn ConsumerAuthenticator>>,
    /// SHA-256 of the control-API bearer token, computed once at startup.
    pub api_token_hash: Option<Vec<u8>>,
    pub started_at: Instant,
    anon_counter: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let config = Arc::new(coordinator.config().clone());
        let origin = Arc::new(OriginValidator::new(&config.server.origins));
        let (authenticator, api_token_hash) = match &config.auth.token {
            Some(token) => (
                Some(Arc::new(TokenAuthenticator::new(token)) as Arc<dyn ConsumerAuthenticator>),
                Some(token_hash(token)),
            ),
            None => (None, None),
        };
        Self {
            coordinator,
            config,
            origin,
            authenticator,
            api_token_hash,
            started_at: Instant::now(),
            anon_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_anonymous(&self) -> ConsumerIdentity {
        let n = self.anon_counter.fetch_add(1, Ordering::Relaxed) + 1;
        ConsumerIdentity::anonymous(n)
    }
}
