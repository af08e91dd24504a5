//! The mutable state bag attached to every [`crate::message::UnifiedMessage`]
//! stream (§3 "Session" → `state`). Reduced by the router, broadcast to
//! consumers as `session_update` patches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Capabilities;

/// Git metadata attached to a session's cwd, refreshed opportunistically
/// by the router after `session_init` and after `result` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dirty: Option<bool>,
}

/// Circuit-breaker / reconnect bookkeeping surfaced to consumers so a
/// dashboard can show why a backend stopped relaunching (§7 BackendFatal).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub open: bool,
    pub consecutive_failures: u32,
    pub opened_at: Option<i64>,
}

/// Per-session team/subagent state, diffed by the router on every
/// backend message (§4.3 step 2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    pub members: Vec<String>,
    pub lead: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub context_used_pct: f64,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            cost_usd: 0.0,
            num_turns: 0,
            context_used_pct: 0.0,
        }
    }
}

/// The `SessionState` bag (§3). Serialized wholesale in `session_init` and
/// as partial patches in `session_update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub cwd: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub compacting: bool,
    #[serde(default)]
    pub git: GitInfo,
    pub capabilities: Option<Capabilities>,
    pub team: Option<TeamState>,
    pub circuit_breaker: Option<CircuitBreakerInfo>,
    /// Any additional backend-reported fields that don't have a first-class
    /// slot yet; kept open-ended like `UnifiedMessage.metadata`.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl SessionState {
    /// Produce a JSON patch containing only fields that differ from
    /// `previous`, for `session_update` broadcasts. `None` when there is no
    /// material difference — callers should skip broadcasting in that case.
    pub fn diff_patch(&self, previous: &SessionState) -> Option<Value> {
        let mut patch = serde_json::Map::new();

        macro_rules! field {
            ($name:literal, $field:ident) => {
                if self.$field != previous.$field {
                    patch.insert(
                        $name.to_string(),
                        serde_json::to_value(&self.$field).unwrap_or(Value::Null),
                    );
                }
            };
        }

        field!("cwd", cwd);
        field!("model", model);
        field!("tools", tools);
        field!("permissionMode", permission_mode);
        field!("version", version);
        field!("mcp_servers", mcp_servers);
        field!("slash_commands", slash_commands);
        field!("skills", skills);
        field!("compacting", compacting);
        field!("git", git);
        field!("capabilities", capabilities);
        field!("team", team);

        if patch.is_empty() {
            None
        } else {
            Some(Value::Object(patch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_patch_none_when_identical() {
        let a = SessionState::default();
        let b = SessionState::default();
        assert!(a.diff_patch(&b).is_none());
    }

    #[test]
    fn diff_patch_contains_only_changed_fields() {
        let mut a = SessionState::default();
        a.model = Some("gpt-5".into());
        let b = SessionState::default();
        let patch = a.diff_patch(&b).unwrap();
        let obj = patch.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj.get("model").unwrap(), "gpt-5");
    }

    #[test]
    fn diff_patch_detects_capabilities_change() {
        let mut a = SessionState::default();
        a.capabilities = Some(Capabilities {
            commands: vec!["/help".into()],
            models: vec![],
            account: None,
        });
        let b = SessionState::default();
        let patch = a.diff_patch(&b).unwrap();
        assert!(patch.as_object().unwrap().contains_key("capabilities"));
    }

    #[test]
    fn diff_patch_detects_team_change() {
        let mut a = SessionState::default();
        a.team = Some(TeamState {
            members: vec!["writer".into()],
            lead: Some("writer".into()),
        });
        let b = SessionState::default();
        let patch = a.diff_patch(&b).unwrap();
        assert!(patch.as_object().unwrap().contains_key("team"));
    }
}
