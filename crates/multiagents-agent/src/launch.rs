//! Subprocess launch specs for each vendor CLI.
//!
//! A `LaunchSpec` is everything the supervisor needs to spawn one agent
//! process: argv, extra environment, and working directory. Prompts ride in
//! vendor-specific channels (flag, config override, or agent file) — never
//! as a positional argument, since persistent mode feeds turns via stdin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::json;
use tracing::debug;

use multiagents_core::PermissionMode;

use crate::error::Result;

/// Read-only tools pre-approved when Claude runs without permission bypass.
const CLAUDE_READONLY_ALLOWLIST: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Compact argv preview for logs, avoiding huge prompt payloads.
    pub fn preview(&self) -> String {
        let mut preview = std::iter::once(self.program.as_str())
            .chain(self.args.iter().take(2).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if self.args.len() > 2 {
            preview.push_str(&format!(" ... (+{} args)", self.args.len() - 2));
        }
        if preview.len() > 220 {
            preview.truncate(217);
            preview.push_str("...");
        }
        preview
    }
}

/// Build the Claude spawn spec. Resume adds `--resume <session-id>`.
pub fn claude_launch(
    system_prompt: &str,
    model: Option<&str>,
    permission_mode: PermissionMode,
    resume_session: Option<&str>,
) -> LaunchSpec {
    let mut spec = LaunchSpec::new("claude").args([
        "-p",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--disable-slash-commands",
        "--setting-sources",
        "",
    ]);
    match permission_mode {
        PermissionMode::Bypass => {
            spec = spec.arg("--dangerously-skip-permissions");
        }
        PermissionMode::Auto | PermissionMode::Manual => {
            let settings = json!({"permissions": {"allow": CLAUDE_READONLY_ALLOWLIST}});
            spec = spec
                .args(["--permission-mode", "dontAsk"])
                .args(["--settings".to_string(), settings.to_string()]);
        }
    }
    if let Some(model) = model {
        spec = spec.args(["--model", model]);
    }
    spec = spec.args(["--system-prompt", system_prompt]);
    if let Some(session) = resume_session {
        spec = spec.args(["--resume", session]);
    }
    spec
}

/// Build the Codex app-server spawn spec. Resume happens at the protocol
/// level (`thread/resume`), so the argv is the same either way.
pub fn codex_launch(system_prompt: &str, model: Option<&str>) -> LaunchSpec {
    // Auto-truncation lets the backend drop old turns instead of failing
    // with a full context window; save-all keeps threads resumable.
    let history = r#"history={persistence="save-all", truncation="auto"}"#;
    let dev_instructions = format!(
        "developer_instructions={}",
        serde_json::Value::String(system_prompt.to_string())
    );
    let mut spec = LaunchSpec::new("codex")
        .arg("app-server")
        .args(["-c", history])
        .args(["-c".to_string(), dev_instructions]);
    if let Some(model) = model {
        spec = spec.args(["-c".to_string(), format!("model=\"{model}\"")]);
    }
    spec
}

/// Build the Kimi wire-mode spawn spec.
pub fn kimi_launch(
    agent_file: &Path,
    session_id: &str,
    permission_mode: PermissionMode,
) -> LaunchSpec {
    let mut spec = LaunchSpec::new("kimi").arg("--wire");
    if permission_mode == PermissionMode::Bypass {
        spec = spec.arg("--yolo");
    }
    spec.args(["--agent-file".to_string(), agent_file.display().to_string()])
        .args(["--session", session_id])
}

/// Writes and caches the Kimi agent file (YAML + system prompt).
///
/// Kimi reads system-level instructions from an agent file rather than a
/// flag, so the prompt is materialized into a temp dir and rewritten only
/// when the inputs change.
pub struct KimiAgentFiles {
    state: Mutex<KimiAgentState>,
}

#[derive(Default)]
struct KimiAgentState {
    dir: Option<tempfile::TempDir>,
    cached_key: Option<(Option<String>, Option<String>, Option<String>, String)>,
}

impl Default for KimiAgentFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl KimiAgentFiles {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KimiAgentState::default()),
        }
    }

    /// Return the agent.yaml path, rewriting the files if any input changed.
    pub fn ensure(
        &self,
        model: Option<&str>,
        prompt_override: Option<&str>,
        project_dir: Option<&str>,
        agent_name: &str,
    ) -> Result<PathBuf> {
        let key = (
            model.map(str::to_string),
            prompt_override.map(str::to_string),
            project_dir.map(str::to_string),
            agent_name.to_string(),
        );
        let mut state = self.state.lock().unwrap();

        let needs_write = state.dir.is_none() || state.cached_key.as_ref() != Some(&key);
        if needs_write {
            if state.dir.is_none() {
                state.dir = Some(
                    tempfile::Builder::new()
                        .prefix("multiagents-kimi-agent-")
                        .tempdir()?,
                );
            }
            let dir = state.dir.as_ref().unwrap().path();
            let prompt_path = dir.join("system.md");
            let agent_path = dir.join("agent.yaml");

            let mut prompt = crate::prompt::build_agent_system_prompt(
                project_dir,
                prompt_override,
                Some(agent_name),
            );
            prompt.push_str("\n\n${KIMI_AGENTS_MD}\n");
            std::fs::write(&prompt_path, prompt)?;

            let mut yaml = format!(
                "version: 1\nagent:\n  extend: default\n  system_prompt_path: {}\n",
                prompt_path.display()
            );
            if let Some(model) = model {
                yaml.push_str(&format!("  model: {model}\n"));
            }
            std::fs::write(&agent_path, yaml)?;

            debug!(agent = agent_name, path = %agent_path.display(), "kimi agent file written");
            state.cached_key = Some(key);
        }

        Ok(state.dir.as_ref().unwrap().path().join("agent.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_bypass_uses_skip_permissions_flag() {
        let spec = claude_launch("sys", Some("opus"), PermissionMode::Bypass, None);
        assert_eq!(spec.program, "claude");
        assert!(spec.args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!spec.args.contains(&"--permission-mode".to_string()));
        let model_pos = spec.args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(spec.args[model_pos + 1], "opus");
    }

    #[test]
    fn claude_manual_gets_readonly_allowlist() {
        let spec = claude_launch("sys", None, PermissionMode::Manual, Some("sid-1"));
        assert!(spec.args.contains(&"--permission-mode".to_string()));
        let settings_pos = spec.args.iter().position(|a| a == "--settings").unwrap();
        assert!(spec.args[settings_pos + 1].contains("WebSearch"));
        let resume_pos = spec.args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(spec.args[resume_pos + 1], "sid-1");
    }

    #[test]
    fn codex_embeds_prompt_as_json_encoded_config() {
        let spec = codex_launch("line1\n\"quoted\"", Some("gpt-5"));
        assert_eq!(spec.args[0], "app-server");
        let dev = spec
            .args
            .iter()
            .find(|a| a.starts_with("developer_instructions="))
            .unwrap();
        // JSON encoding keeps the newline and quotes escaped.
        assert!(dev.contains("line1\\n"));
        assert!(dev.contains("\\\"quoted\\\""));
        assert!(spec.args.iter().any(|a| a == "model=\"gpt-5\""));
    }

    #[test]
    fn kimi_agent_file_is_cached_until_inputs_change() {
        let files = KimiAgentFiles::new();
        let first = files.ensure(None, None, None, "kimi").unwrap();
        let second = files.ensure(None, None, None, "kimi").unwrap();
        assert_eq!(first, second);

        let yaml = std::fs::read_to_string(&first).unwrap();
        assert!(yaml.contains("extend: default"));
        assert!(!yaml.contains("model:"));

        let with_model = files.ensure(Some("k2"), None, None, "kimi").unwrap();
        let yaml = std::fs::read_to_string(&with_model).unwrap();
        assert!(yaml.contains("model: k2"));

        let prompt = std::fs::read_to_string(with_model.parent().unwrap().join("system.md")).unwrap();
        assert!(prompt.contains("${KIMI_AGENTS_MD}"));
        assert!(prompt.contains("You are kimi,"));
    }

    #[test]
    fn preview_compacts_long_argv() {
        let spec = claude_launch(&"x".repeat(500), None, PermissionMode::Bypass, None);
        let preview = spec.preview();
        assert!(preview.len() <= 220);
        assert!(preview.contains("claude"));
    }
}
