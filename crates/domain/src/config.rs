use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    /// 0 = pick an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "d_1mib")]
    pub payload_limit_bytes: usize,
    #[serde(default)]
    pub origins: OriginConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 0,
            payload_limit_bytes: d_1mib(),
            origins: OriginConfig::default(),
        }
    }
}

/// Origin validation for browser consumers. Localhost variants are always
/// allowed; `allowed` extends the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default = "d_true")]
    pub allow_missing: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            allow_missing: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bearer token for the daemon control API and token-authenticated
/// consumers. `None` = dev mode, no auth enforced.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "d_32")]
    pub max_sessions: usize,
    #[serde(default = "d_500")]
    pub max_message_history: usize,
    #[serde(default = "d_20")]
    pub initial_replay_count: usize,
    #[serde(default = "d_64")]
    pub pending_message_queue_max: usize,
    /// 0 disables the idle reaper.
    #[serde(default)]
    pub idle_timeout_ms: u64,
    #[serde(default = "d_150")]
    pub save_debounce_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: d_32(),
            max_message_history: d_500(),
            initial_replay_count: d_20(),
            pending_message_queue_max: d_64(),
            idle_timeout_ms: 0,
            save_debounce_ms: d_150(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer plane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "d_1mib")]
    pub max_message_size: usize,
    #[serde(default = "d_5000")]
    pub auth_timeout_ms: u64,
    #[serde(default = "d_1000")]
    pub high_water_mark: usize,
    #[serde(default = "d_5000_usize")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_message_size: d_1mib(),
            auth_timeout_ms: d_5000(),
            high_water_mark: d_1000(),
            max_queue_size: d_5000_usize(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_30")]
    pub burst_size: u32,
    #[serde(default = "d_10f")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: d_30(),
            refill_per_sec: d_10f(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backends & launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "d_adapter")]
    pub default_adapter: String,
    #[serde(default = "d_10000")]
    pub initialize_timeout_ms: u64,
    #[serde(default = "d_30000")]
    pub connect_timeout_ms: u64,
    #[serde(default = "d_15000")]
    pub reconnect_grace_ms: u64,
    #[serde(default = "d_5000")]
    pub kill_grace_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_adapter: d_adapter(),
            initialize_timeout_ms: d_10000(),
            connect_timeout_ms: d_30000(),
            reconnect_grace_ms: d_15000(),
            kill_grace_ms: d_5000(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "d_claude_bin")]
    pub claude_binary: String,
    #[serde(default = "d_codex_bin")]
    pub codex_binary: String,
    #[serde(default = "d_gemini_bin")]
    pub gemini_binary: String,
    #[serde(default = "d_acp_bin")]
    pub acp_binary: String,
    /// Base URL of an already-running opencode server.
    #[serde(default = "d_opencode_url")]
    pub opencode_url: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            claude_binary: d_claude_bin(),
            codex_binary: d_codex_bin(),
            gemini_binary: d_gemini_bin(),
            acp_binary: d_acp_bin(),
            opencode_url: d_opencode_url(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Apply environment variable overrides on top of the file config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("BEAMCODE_TOKEN") {
            if !token.is_empty() {
                self.auth.token = Some(token);
            }
        }
        if let Ok(port) = std::env::var("BEAMCODE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(dir) = std::env::var("BEAMCODE_DATA_DIR") {
            if !dir.is_empty() {
                self.storage.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(origins) = std::env::var("BEAMCODE_ORIGINS") {
            self.server.origins.allowed = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Validate the configuration. Errors block startup, warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.consumer.max_queue_size < self.consumer.high_water_mark {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!(
                    "consumer.max_queue_size ({}) must be >= consumer.high_water_mark ({})",
                    self.consumer.max_queue_size, self.consumer.high_water_mark
                ),
            });
        }
        if self.consumer.rate_limit.burst_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "consumer.rate_limit.burst_size must be > 0".into(),
            });
        }
        if self.sessions.max_sessions == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_sessions must be > 0".into(),
            });
        }
        if self.auth.token.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "auth.token not set — control API and consumers are unauthenticated"
                    .into(),
            });
        }
        if self.server.host != "127.0.0.1" && self.server.host != "localhost" {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "server.host = {:?} — the broker is designed for loopback",
                    self.server.host
                ),
            });
        }
        if self.sessions.idle_timeout_ms > 0 && self.sessions.idle_timeout_ms < 60_000 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "sessions.idle_timeout_ms below 60s will reap sessions aggressively"
                    .into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_adapter() -> String {
    "claude".into()
}
fn d_claude_bin() -> String {
    "claude".into()
}
fn d_codex_bin() -> String {
    "codex".into()
}
fn d_gemini_bin() -> String {
    "gemini".into()
}
fn d_acp_bin() -> String {
    "acp-agent".into()
}
fn d_opencode_url() -> String {
    "http://127.0.0.1:4096".into()
}
fn d_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beamcode")
}
fn d_true() -> bool {
    true
}
fn d_1mib() -> usize {
    1024 * 1024
}
fn d_32() -> usize {
    32
}
fn d_500() -> usize {
    500
}
fn d_20() -> usize {
    20
}
fn d_64() -> usize {
    64
}
fn d_150() -> u64 {
    150
}
fn d_1000() -> usize {
    1000
}
fn d_5000_usize() -> usize {
    5000
}
fn d_5000() -> u64 {
    5000
}
fn d_10000() -> u64 {
    10_000
}
fn d_15000() -> u64 {
    15_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_30() -> u32 {
    30
}
fn d_10f() -> f64 {
    10.0
}
