use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Which CLI backend an agent persona runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Kimi,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Kimi => "kimi",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "kimi" => Ok(AgentKind::Kimi),
            other => Err(CoreError::UnknownAgentType(other.to_string())),
        }
    }
}

/// A named agent participating in a session.
///
/// `name` is unique within a session; the default personas use the kind
/// name itself ("claude", "codex", "kimi").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPersona {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentPersona {
    /// Persona whose name matches its kind, no role or model override.
    pub fn bare(kind: AgentKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            role: String::new(),
            model: None,
        }
    }
}

/// How tool permission requests from a CLI agent are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Auto-approve everything (skip permission gating entirely).
    #[default]
    Bypass,
    /// CLI-side policy decides; read-only tools are pre-approved.
    Auto,
    /// Every request is surfaced to the user and fails closed on timeout.
    Manual,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Bypass => "bypass",
            PermissionMode::Auto => "auto",
            PermissionMode::Manual => "manual",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bypass" => Ok(PermissionMode::Bypass),
            "auto" => Ok(PermissionMode::Auto),
            "manual" => Ok(PermissionMode::Manual),
            other => Err(CoreError::Config(format!("unknown permission mode: {other}"))),
        }
    }
}

/// One entry in a session's append-only conversation history.
///
/// `role` is "user", "system", "dm:<agent>" or an agent name. Agent entries
/// only ever hold the shareable extract, "[PASS]", or the withheld
/// placeholder — never raw model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            round: None,
        }
    }

    pub fn in_round(role: impl Into<String>, content: impl Into<String>, round: u64) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            round: Some(round),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_through_str() {
        for kind in [AgentKind::Claude, AgentKind::Codex, AgentKind::Kimi] {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("gpt".parse::<AgentKind>().is_err());
    }

    #[test]
    fn persona_serializes_kind_as_type() {
        let persona = AgentPersona::bare(AgentKind::Codex);
        let json = serde_json::to_string(&persona).unwrap();
        assert!(json.contains(r#""type":"codex""#));
        assert!(json.contains(r#""name":"codex""#));
    }

    #[test]
    fn history_message_round_is_optional_on_the_wire() {
        let msg = HistoryMessage::new("user", "hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("round"));

        let tagged = HistoryMessage::in_round("claude", "[PASS]", 3);
        let json = serde_json::to_string(&tagged).unwrap();
        assert!(json.contains(r#""round":3"#));
    }
}
