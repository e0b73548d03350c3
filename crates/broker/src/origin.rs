//! Origin validation for browser consumers.
//!
//! Localhost origins (`localhost`, `127.0.0.1`, `[::1]`, any port, http or
//! https) are always allowed; the config extends the list. Missing origins
//! (non-browser clients) are allowed by default.

use bc_domain::config::OriginConfig;

pub struct OriginValidator {
    allowed: Vec<String>,
    allow_missing: bool,
}

impl OriginValidator {
    pub fn new(config: &OriginConfig) -> Self {
        Self {
            allowed: config
                .allowed
                .iter()
                .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
            allow_missing: config.allow_missing,
        }
    }

    pub fn validate(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return self.allow_missing;
        };
        let origin = origin.trim_end_matches('/').to_ascii_lowercase();

        if is_localhost_origin(&origin) {
            return true;
        }
        self.allowed.iter().any(|allowed| allowed == &origin)
    }
}

fn is_localhost_origin(origin: &str) -> bool {
    let rest = if let Some(rest) = origin.strip_prefix("http://") {
        rest
    } else if let Some(rest) = origin.strip_prefix("https://") {
        rest
    } else {
        return false;
    };

    // Strip the port, if any. `[::1]:8080` keeps the brackets as the host.
    let host = if let Some(end) = rest.find("]") {
        &rest[..=end]
    } else {
        rest.split(':').next().unwrap_or(rest)
    };

    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(allowed: &[&str], allow_missing: bool) -> OriginValidator {
        OriginValidator::new(&OriginConfig {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            allow_missing,
        })
    }

    #[test]
    fn localhost_variants_always_allowed() {
        let v = validator(&[], true);
        assert!(v.validate(Some("http://localhost")));
        assert!(v.validate(Some("http://localhost:3000")));
        assert!(v.validate(Some("https://127.0.0.1:8443")));
        assert!(v.validate(Some("http://[::1]:9000")));
        assert!(v.validate(Some("HTTP://LOCALHOST:3000")));
    }

    #[test]
    fn foreign_origins_rejected_unless_listed() {
        let v = validator(&["https://app.example.com"], true);
        assert!(v.validate(Some("https://app.example.com")));
        assert!(v.validate(Some("https://APP.example.COM")));
        assert!(!v.validate(Some("https://evil.example.com")));
        assert!(!v.validate(Some("ftp://localhost")));
    }

    #[test]
    fn missing_origin_policy_is_configurable() {
        assert!(validator(&[], true).validate(None));
        assert!(!validator(&[], false).validate(None));
    }

    #[test]
    fn lookalike_hosts_rejected() {
        let v = validator(&[], true);
        assert!(!v.validate(Some("http://localhost.evil.com")));
        assert!(!v.validate(Some("http://127.0.0.1.evil.com")));
    }
}
