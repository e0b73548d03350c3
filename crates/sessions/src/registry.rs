//! Per-session slash command registry.
//!
//! Three sources feed it: the broker's built-ins, commands reported by the
//! CLI (capabilities handshake or `session_init`), and commands derived from
//! skills. Restored sessions re-populate it from persisted state so commands
//! resolve before the backend re-attaches.

use std::collections::BTreeMap;

use bc_domain::state::CommandInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Builtin,
    Cli,
    Skill,
}

#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub info: CommandInfo,
    pub source: CommandSource,
}

#[derive(Debug)]
pub struct CommandRegistry {
    // BTreeMap keeps listings stable for consumers.
    entries: BTreeMap<String, CommandEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        registry.insert(
            CommandInfo {
                name: "/help".into(),
                description: Some("List available commands".into()),
                argument_hint: None,
            },
            CommandSource::Builtin,
        );
        registry
    }

    fn insert(&mut self, info: CommandInfo, source: CommandSource) {
        self.entries
            .insert(info.name.clone(), CommandEntry { info, source });
    }

    /// Register CLI-reported commands. Built-ins are never overridden.
    pub fn register_cli_commands(&mut self, commands: impl IntoIterator<Item = CommandInfo>) {
        for info in commands {
            if self.source_of(&info.name) == Some(CommandSource::Builtin) {
                continue;
            }
            self.insert(info, CommandSource::Cli);
        }
    }

    /// Register skill-derived commands (`/skill-name`).
    pub fn register_skills<S: AsRef<str>>(&mut self, skills: &[S]) {
        for skill in skills {
            let name = format!("/{}", skill.as_ref().trim_start_matches('/'));
            if self.entries.contains_key(&name) {
                continue;
            }
            self.insert(
                CommandInfo {
                    name,
                    description: Some(format!("Run the {} skill", skill.as_ref())),
                    argument_hint: None,
                },
                CommandSource::Skill,
            );
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn source_of(&self, name: &str) -> Option<CommandSource> {
        self.entries.get(name).map(|e| e.source)
    }

    pub fn get(&self, name: &str) -> Option<&CommandEntry> {
        self.entries.get(name)
    }

    pub fn list(&self) -> Vec<CommandInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str) -> CommandInfo {
        CommandInfo {
            name: name.into(),
            description: None,
            argument_hint: None,
        }
    }

    #[test]
    fn builtins_are_present_and_protected() {
        let mut registry = CommandRegistry::new();
        assert!(registry.contains("/help"));

        registry.register_cli_commands([cmd("/help")]);
        assert_eq!(registry.source_of("/help"), Some(CommandSource::Builtin));
    }

    #[test]
    fn cli_and_skill_sources_merge() {
        let mut registry = CommandRegistry::new();
        registry.register_cli_commands([cmd("/compact"), cmd("/review")]);
        registry.register_skills(&["deploy"]);

        assert_eq!(registry.source_of("/compact"), Some(CommandSource::Cli));
        assert_eq!(registry.source_of("/deploy"), Some(CommandSource::Skill));
        assert_eq!(registry.len(), 4); // /help + 2 CLI + 1 skill
    }

    #[test]
    fn cli_commands_shadow_skills() {
        let mut registry = CommandRegistry::new();
        registry.register_skills(&["compact"]);
        registry.register_cli_commands([cmd("/compact")]);
        // Last CLI registration wins over the earlier skill entry.
        assert_eq!(registry.source_of("/compact"), Some(CommandSource::Cli));
    }

    #[test]
    fn listing_is_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register_cli_commands([cmd("/zeta"), cmd("/alpha")]);
        let names: Vec<String> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["/alpha", "/help", "/zeta"]);
    }
}
