//! Consumer authentication.
//!
//! When a bearer token is configured, consumers must present it (query
//! `?token=` or an `Authorization: Bearer` header) and may claim an identity
//! through query parameters. Tokens are compared constant-time via SHA-256
//! digests so length never leaks.

use std::collections::HashMap;
use std::net::SocketAddr;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use bc_domain::error::{Error, Result};
use bc_protocol::ConsumerRole;
use bc_sessions::ConsumerIdentity;

/// Everything an authenticator may inspect about a connection attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
}

impl AuthContext {
    /// The presented token: query param first, then the bearer header.
    pub fn token(&self) -> Option<&str> {
        if let Some(token) = self.query.get("token") {
            return Some(token);
        }
        self.headers
            .get("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
    }
}

#[async_trait::async_trait]
pub trait ConsumerAuthenticator: Send + Sync {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<ConsumerIdentity>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token helpers (shared with the control API)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn token_hash(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

/// Constant-time comparison of a presented token against a stored hash.
/// Hashing normalizes lengths so `ct_eq` always compares 32 bytes.
pub fn token_matches(presented: &str, expected_hash: &[u8]) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    presented.as_slice().ct_eq(expected_hash).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in token authenticator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TokenAuthenticator {
    expected_hash: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(token: &str) -> Self {
        Self {
            expected_hash: token_hash(token),
        }
    }
}

#[async_trait::async_trait]
impl ConsumerAuthenticator for TokenAuthenticator {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<ConsumerIdentity> {
        let Some(presented) = ctx.token() else {
            return Err(Error::Unauthenticated("missing token".into()));
        };
        if !token_matches(presented, &self.expected_hash) {
            return Err(Error::Unauthenticated("invalid token".into()));
        }

        let user_id = ctx
            .query
            .get("user_id")
            .cloned()
            .unwrap_or_else(|| "token-user".into());
        let display_name = ctx
            .query
            .get("display_name")
            .cloned()
            .unwrap_or_else(|| user_id.clone());
        let role = match ctx.query.get("role").map(String::as_str) {
            Some("observer") => ConsumerRole::Observer,
            _ => ConsumerRole::Participant,
        };

        Ok(ConsumerIdentity {
            user_id,
            display_name,
            role,
        })
    }
}
