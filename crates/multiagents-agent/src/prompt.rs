//! System prompt assembly for spawned CLI agents.
//!
//! Static directives (Share tags, coordination tools, round model, [PASS])
//! live here and ride in each vendor's system-prompt channel; dynamic
//! per-session context is delivered in the first message instead.

const AGENT_BEHAVIOR_PROMPT: &str = "Respond directly to the conversation. You may use tools \
(reading files, searching, writing code) when the user's request requires \
it, but always conclude with a direct text response. Only mention another \
participant (e.g. @User or @AgentName) when you are expecting an answer. \
If you have nothing meaningful to add, respond with exactly [PASS]. \
If you already responded and have nothing new to add, respond with exactly [PASS].";

const RESPONSE_FORMAT_PROMPT: &str = "RESPONSE FORMAT — IMPORTANT:\n\
Wrap ALL content meant for the conversation in <Share>...</Share> tags.\n\
Content outside Share tags is private — invisible to everyone, including the user.\n\
If you omit Share tags, your entire response becomes: \
\"(private response withheld)\" — nobody (not even the user) sees anything.\n\
The only exception is [PASS] — it is a system directive and does NOT need Share tags.\n\n\
Share tags MUST be at the top level of your response — never inside \
thinking or reasoning blocks. Put all substantive content (findings, \
proposals, questions, lists) inside Share tags, not just @mentions.\n\n\
Example:\n\
  (internal reasoning and tool calls — private)\n\
  <Share>\n\
  Here's what I found: [detailed findings]\n\
  Suggested approach: [proposal]\n\
  @AgentName can you review this?\n\
  </Share>";

const COORDINATION_PROMPT: &str = "COORDINATION TOOLS (use inside <Share> tags):\n\
  @AgentName      - Direct a question or request to a specific agent\n\
  +1 AgentName    - Show agreement and build on someone's idea\n\
  [HANDOFF:Agent] - Pass a specific task to another agent\n\
  [STATUS:msg]    - Clarify your current intent\n\
                    Examples: [EXPLORE] [DECISION] [BLOCKED] [DONE]\n\n\
ROUND MODEL: All agents respond simultaneously each round. \
Commit to your approach — don't hedge or wait \
for confirmation that won't come until next round.\n\
If another agent already started work on something last round, pick \
complementary work instead of duplicating effort.";

const ISOLATED_DIR_PROMPT: &str = "IMPORTANT: You are running in an isolated working directory, NOT the project \
root. Always use absolute file paths (e.g. /Users/user/project/src/file.py) \
when reading, editing, or referencing project files. Relative paths will \
resolve to your temp directory and fail.";

const TASK_CARDS_PROMPT: &str = "TASK CARDS: The session may have a task board with cards that track work items \
through phases: Backlog → Planning → Reviewing → Implementing → Done. \
When you are assigned to a card phase (planner, implementer, or reviewer), \
use [DONE] in your response to signal your phase is complete. The prompt will \
include a [TASK:id] prefix when you are working on a specific card.";

fn static_guidance() -> String {
    format!("{AGENT_BEHAVIOR_PROMPT}\n\n{RESPONSE_FORMAT_PROMPT}\n\n{COORDINATION_PROMPT}")
}

fn agent_role_prompt(agent_name: Option<&str>) -> String {
    let identity = match agent_name {
        Some(name) => format!("You are {name},"),
        None => "You are a participant".to_string(),
    };
    format!(
        "{identity} in a multi-agent group chat with a human user and \
other AI agents.\n\n{}",
        static_guidance()
    )
}

/// Build the system prompt with the appropriate working-dir section.
pub fn build_agent_system_prompt(
    project_dir: Option<&str>,
    base_prompt: Option<&str>,
    agent_name: Option<&str>,
) -> String {
    let role_prompt = match base_prompt {
        Some(base) if !base.trim().is_empty() => {
            format!("{}\n\n{}", base.trim(), static_guidance())
        }
        _ => agent_role_prompt(agent_name),
    };
    let dir_section = match project_dir {
        Some(dir) if !dir.is_empty() => format!(
            "IMPORTANT: The project directory is {dir}. \
You are working directly in this directory."
        ),
        _ => ISOLATED_DIR_PROMPT.to_string(),
    };
    format!("{role_prompt}\n\n{dir_section}\n\n{TASK_CARDS_PROMPT}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_agent_gets_identity_line() {
        let prompt = build_agent_system_prompt(None, None, Some("claude"));
        assert!(prompt.starts_with("You are claude,"));
        assert!(prompt.contains("[PASS]"));
        assert!(prompt.contains("isolated working directory"));
        assert!(prompt.contains("TASK CARDS"));
    }

    #[test]
    fn project_dir_replaces_isolation_warning() {
        let prompt = build_agent_system_prompt(Some("/work/repo"), None, Some("codex"));
        assert!(prompt.contains("The project directory is /work/repo"));
        assert!(!prompt.contains("isolated working directory"));
    }

    #[test]
    fn override_prompt_keeps_static_guidance() {
        let prompt = build_agent_system_prompt(None, Some("You are a security reviewer."), None);
        assert!(prompt.starts_with("You are a security reviewer."));
        assert!(prompt.contains("<Share>"));
    }
}
