use bc_domain::config::{Config, ConfigSeverity};

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 0);
}

#[test]
fn explicit_server_section_parses() {
    let toml_str = r#"
[server]
host = "127.0.0.1"
port = 8790

[auth]
token = "secret"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.port, 8790);
    assert_eq!(config.auth.token.as_deref(), Some("secret"));
    // Defaults still fill the untouched sections.
    assert_eq!(config.sessions.max_message_history, 500);
    assert_eq!(config.consumer.high_water_mark, 1000);
    assert_eq!(config.backend.default_adapter, "claude");
}

#[test]
fn queue_smaller_than_high_water_is_an_error() {
    let toml_str = r#"
[consumer]
high_water_mark = 100
max_queue_size = 50
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("max_queue_size")));
}

#[test]
fn missing_token_is_only_a_warning() {
    let config = Config::default();
    let issues = config.validate();
    assert!(!issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    assert!(issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Warning && i.message.contains("auth.token")));
}
