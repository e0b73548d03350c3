//! Adapter resolution.
//!
//! Maps adapter names to instances. The inverted `claude` adapter is a
//! singleton constructed eagerly so its rendezvous table exists before any
//! CLI dial-in; the dial-out adapters are cheap and built per resolve.

use std::sync::Arc;
use std::time::Duration;

use bc_domain::config::{BackendConfig, LauncherConfig};
use bc_domain::error::{Error, Result};

use crate::acp::AcpAdapter;
use crate::claude::ClaudeAdapter;
use crate::codex::CodexAdapter;
use crate::gemini::GeminiAdapter;
use crate::opencode::OpencodeAdapter;
use crate::traits::BackendAdapter;

/// The closed set of adapter names.
pub const AVAILABLE: &[&str] = &["claude", "codex", "gemini", "acp", "opencode"];

/// Normalize an adapter name. `sdk-url` is the legacy spelling of `claude`.
pub fn canonical(name: &str) -> Option<&'static str> {
    match name {
        "claude" | "sdk-url" => Some("claude"),
        "codex" => Some("codex"),
        "gemini" => Some("gemini"),
        "acp" => Some("acp"),
        "opencode" => Some("opencode"),
        _ => None,
    }
}

pub struct AdapterResolver {
    default_name: String,
    connect_timeout: Duration,
    launcher: LauncherConfig,
    claude: Arc<ClaudeAdapter>,
}

impl AdapterResolver {
    pub fn new(backend: &BackendConfig, launcher: &LauncherConfig) -> Self {
        let connect_timeout = Duration::from_millis(backend.connect_timeout_ms);
        Self {
            default_name: canonical(&backend.default_adapter)
                .unwrap_or("claude")
                .to_string(),
            connect_timeout,
            launcher: launcher.clone(),
            claude: Arc::new(ClaudeAdapter::new(connect_timeout)),
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// The eager inverted singleton, used by the CLI gateway.
    pub fn claude(&self) -> Arc<ClaudeAdapter> {
        self.claude.clone()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        match canonical(name) {
            Some("claude") => Ok(self.claude.clone()),
            Some("codex") => Ok(Arc::new(CodexAdapter::new(
                self.launcher.codex_binary.clone(),
                self.connect_timeout,
            ))),
            Some("gemini") => Ok(Arc::new(GeminiAdapter::new(
                self.launcher.gemini_binary.clone(),
                self.connect_timeout,
            ))),
            Some("acp") => Ok(Arc::new(AcpAdapter::new(
                self.launcher.acp_binary.clone(),
                self.connect_timeout,
            ))),
            Some("opencode") => Ok(Arc::new(OpencodeAdapter::new(
                self.launcher.opencode_url.clone(),
                self.connect_timeout,
            ))),
            _ => Err(Error::ConnectFailed {
                adapter: name.to_string(),
                message: format!("unknown adapter (available: {})", AVAILABLE.join(", ")),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AdapterResolver {
        AdapterResolver::new(&BackendConfig::default(), &LauncherConfig::default())
    }

    #[test]
    fn resolves_the_closed_set() {
        let resolver = resolver();
        for name in AVAILABLE {
            let adapter = resolver.resolve(name).unwrap();
            assert_eq!(&adapter.name(), name);
        }
    }

    #[test]
    fn sdk_url_is_an_alias_for_claude() {
        let resolver = resolver();
        let adapter = resolver.resolve("sdk-url").unwrap();
        assert_eq!(adapter.name(), "claude");
        assert!(adapter.is_inverted());
    }

    #[test]
    fn claude_is_a_singleton() {
        let resolver = resolver();
        let a = resolver.resolve("claude").unwrap();
        let b = resolver.resolve("sdk-url").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = resolver().resolve("cursor").unwrap_err();
        assert_eq!(err.kind(), "connect_failed");
    }

    #[test]
    fn default_name_follows_config() {
        let mut backend = BackendConfig::default();
        backend.default_adapter = "sdk-url".into();
        let resolver = AdapterResolver::new(&backend, &LauncherConfig::default());
        assert_eq!(resolver.default_name(), "claude");
    }
}
