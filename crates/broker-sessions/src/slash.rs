//! Slash command registry and resolver (§4.6).
//!
//! A `/command` typed by a consumer is resolved against three tiers, in
//! order: commands the backend itself reported during the capabilities
//! handshake (passed straight through as a backend message), commands
//! defined by the workspace (skills/custom command files), and finally a
//! small set of broker-native built-ins that never reach the backend.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommandSource {
    /// Tier 1 (§4.6): the adapter's own native command executor claims
    /// this command — reported via the capabilities handshake's
    /// `commands` list. Result broadcasts with `source="adapter"`.
    Backend,
    /// Tier 2a (§4.6, "emulated"): a workspace-defined custom command;
    /// `body` is its expansion. Broadcasts with `source="emulated"`.
    Workspace { body: String },
    /// Tier 2b (§4.6, "emulated"): a broker-native built-in, identified by
    /// name. Broadcasts with `source="emulated"`.
    BuiltIn { name: String },
    /// Tier 3 (§4.6, "native passthrough"): unresolved by the first two
    /// tiers, but the adapter's capability descriptor claims
    /// `slashCommands=true` — send the raw text through as a
    /// `user_message` and recover the result later from the backend's
    /// echoed reply (`source="cli"`).
    Passthrough,
    Unknown,
}

/// A passthrough slash command awaiting interception of the backend's
/// echoed `user_message` (§4.6 tier 3). Queued FIFO per session; the next
/// backend-originated `user_message` is assumed to be this command's echo.
#[derive(Debug, Clone)]
pub struct PassthroughDescriptor {
    pub command: String,
    pub request_id: Option<String>,
    pub slash_request_id: String,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct WorkspaceCommand {
    pub name: String,
    pub description: String,
    pub body: String,
}

/// Per-session registry of resolvable slash commands.
pub struct SlashCommandRegistry {
    backend_commands: RwLock<Vec<String>>,
    workspace_commands: RwLock<HashMap<String, WorkspaceCommand>>,
    built_ins: HashMap<&'static str, &'static str>,
}

impl SlashCommandRegistry {
    pub fn new() -> Self {
        Self {
            backend_commands: RwLock::new(Vec::new()),
            workspace_commands: RwLock::new(HashMap::new()),
            built_ins: default_built_ins(),
        }
    }

    /// Replace the set of commands the backend reported during its
    /// capabilities handshake (§4.7).
    pub fn set_backend_commands(&self, commands: Vec<String>) {
        *self.backend_commands.write() = commands;
    }

    pub fn register_workspace_command(&self, command: WorkspaceCommand) {
        self.workspace_commands
            .write()
            .insert(command.name.clone(), command);
    }

    /// Resolve a command name (without the leading `/`) against the first
    /// two tiers only — adapter-native, then emulated. Callers that also
    /// want the tier-3 passthrough fallback should use
    /// [`resolve_with_passthrough`](Self::resolve_with_passthrough).
    pub fn resolve(&self, name: &str) -> SlashCommandSource {
        if self.backend_commands.read().iter().any(|c| c == name) {
            return SlashCommandSource::Backend;
        }
        if let Some(cmd) = self.workspace_commands.read().get(name) {
            return SlashCommandSource::Workspace {
                body: cmd.body.clone(),
            };
        }
        if self.built_ins.contains_key(name) {
            return SlashCommandSource::BuiltIn { name: name.to_string() };
        }
        SlashCommandSource::Unknown
    }

    /// Resolve against all three tiers (§4.6): adapter-native, emulated,
    /// then — only when `adapter_supports_passthrough` — native
    /// passthrough rather than `Unknown`.
    pub fn resolve_with_passthrough(&self, name: &str, adapter_supports_passthrough: bool) -> SlashCommandSource {
        match self.resolve(name) {
            SlashCommandSource::Unknown if adapter_supports_passthrough => SlashCommandSource::Passthrough,
            other => other,
        }
    }

    pub fn built_in_description(&self, name: &str) -> Option<&'static str> {
        self.built_ins.get(name).copied()
    }
}

impl Default for SlashCommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a `<local-command-stdout>…</local-command-stdout>` wrapper off a
/// backend's echoed passthrough reply, if present (§4.6 tier 3). Text with
/// no wrapper passes through unchanged.
pub fn strip_local_command_stdout(text: &str) -> String {
    const OPEN: &str = "<local-command-stdout>";
    const CLOSE: &str = "</local-command-stdout>";
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix(OPEN).and_then(|s| s.strip_suffix(CLOSE)) {
        inner.trim().to_string()
    } else {
        text.to_string()
    }
}

fn default_built_ins() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("help", "List available commands"),
        ("clear", "Clear the conversation transcript"),
        ("compact", "Summarize history to free context"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_command_takes_priority_over_built_in() {
        let registry = SlashCommandRegistry::new();
        registry.set_backend_commands(vec!["clear".into()]);
        assert_eq!(registry.resolve("clear"), SlashCommandSource::Backend);
    }

    #[test]
    fn workspace_command_takes_priority_over_built_in() {
        let registry = SlashCommandRegistry::new();
        registry.register_workspace_command(WorkspaceCommand {
            name: "deploy".into(),
            description: "Run the deploy script".into(),
            body: "run deploy.sh".into(),
        });
        match registry.resolve("deploy") {
            SlashCommandSource::Workspace { body } => assert_eq!(body, "run deploy.sh"),
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_built_in() {
        let registry = SlashCommandRegistry::new();
        assert_eq!(
            registry.resolve("help"),
            SlashCommandSource::BuiltIn { name: "help".into() }
        );
    }

    #[test]
    fn unknown_command_resolves_to_unknown() {
        let registry = SlashCommandRegistry::new();
        assert_eq!(registry.resolve("does-not-exist"), SlashCommandSource::Unknown);
    }

    #[test]
    fn unresolved_command_falls_back_to_passthrough_when_adapter_supports_it() {
        let registry = SlashCommandRegistry::new();
        assert_eq!(
            registry.resolve_with_passthrough("mystery", true),
            SlashCommandSource::Passthrough
        );
        assert_eq!(
            registry.resolve_with_passthrough("mystery", false),
            SlashCommandSource::Unknown
        );
    }

    #[test]
    fn built_in_still_wins_over_passthrough() {
        let registry = SlashCommandRegistry::new();
        assert_eq!(
            registry.resolve_with_passthrough("help", true),
            SlashCommandSource::BuiltIn { name: "help".into() }
        );
    }

    #[test]
    fn strip_local_command_stdout_removes_wrapper() {
        assert_eq!(
            strip_local_command_stdout("<local-command-stdout>42 files\n</local-command-stdout>"),
            "42 files"
        );
    }

    #[test]
    fn strip_local_command_stdout_passes_through_unwrapped_text() {
        assert_eq!(strip_local_command_stdout("plain output"), "plain output");
    }
}
