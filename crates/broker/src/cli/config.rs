//! `beamcode config validate` / `beamcode config show`.

use std::path::Path;

use bc_domain::config::{Config, ConfigSeverity};

/// Print validation issues; returns whether the config is usable.
pub fn validate(config: &Config, path: &Path) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: ok", path.display());
        return true;
    }

    let mut errors = 0;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => {
                println!("error: {issue}");
                errors += 1;
            }
        }
    }
    errors == 0
}

/// Print the effective configuration (after env overrides), token redacted.
pub fn show(config: &Config) {
    let mut shown = config.clone();
    if shown.auth.token.is_some() {
        shown.auth.token = Some("<redacted>".into());
    }
    match toml::to_string_pretty(&shown) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("failed to render config: {e}"),
    }
}
