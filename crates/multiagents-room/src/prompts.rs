//! Prompt construction for round-batched and persistent dispatch.

use multiagents_core::HistoryMessage;

use crate::share::{extract_handoffs, extract_mentions};

/// One participant as shown to the others ("name (Type)" when they differ).
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub name: String,
    pub kind: String,
}

const ROLE_DISPLAY: &[(&str, &str)] = &[
    ("user", "User"),
    ("claude", "Claude"),
    ("codex", "Codex"),
    ("kimi", "Kimi"),
    ("system", "System"),
];

pub(crate) const PERSISTENT_REPLY_DIRECTIVE: &str =
    "Respond directly. Put all user-visible content inside <Share>...</Share>. \
If no action is needed, respond with exactly [PASS].";

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn role_display(role: &str) -> String {
    ROLE_DISPLAY
        .iter()
        .find(|(key, _)| *key == role)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| capitalize(role))
}

/// Split history into (older_history, current_context).
///
/// Current context = messages from the previous agent round plus any user
/// messages that immediately precede them (the trigger). For round 1
/// everything is current context. User messages carry no round tag.
fn split_history(history: &[HistoryMessage], current_round: u64) -> (usize, usize) {
    if current_round <= 1 {
        return (0, 0);
    }
    let prev_round = current_round - 1;

    let mut context_start = history.len();
    for (i, msg) in history.iter().enumerate() {
        if msg.round == Some(prev_round) {
            context_start = i;
            break;
        }
    }
    while context_start > 0 && history[context_start - 1].round.is_none() {
        context_start -= 1;
    }
    (0, context_start)
}

/// History content is already processed (shareable extracted by the room),
/// so formatting is just role labeling.
fn format_messages(msgs: &[HistoryMessage]) -> Vec<String> {
    msgs.iter()
        .map(|m| format!("[{}]: {}", role_display(&m.role), m.content))
        .collect()
}

/// Notice if this agent was @mentioned or handed off to in the current round.
fn build_mention_notice(current_msgs: &[HistoryMessage], agent_name: &str) -> String {
    let mut mentioners: Vec<String> = Vec::new();
    let mut handoffs: Vec<(String, String)> = Vec::new();
    let agent_lower = agent_name.to_lowercase();

    for msg in current_msgs {
        if msg.role == agent_name {
            continue;
        }
        for mention in extract_mentions(&msg.content) {
            if mention.to_lowercase() == agent_lower {
                let label = role_display(&msg.role);
                if !mentioners.contains(&label) {
                    mentioners.push(label);
                }
            }
        }
        for (target, context) in extract_handoffs(&msg.content) {
            if target.to_lowercase() == agent_lower {
                handoffs.push((role_display(&msg.role), context));
            }
        }
    }

    if mentioners.is_empty() && handoffs.is_empty() {
        return String::new();
    }

    let mut parts: Vec<String> = Vec::new();
    if !mentioners.is_empty() {
        parts.push(format!("You were @mentioned by {}.", mentioners.join(", ")));
    }
    for (sender, context) in handoffs {
        parts.push(format!("{sender} handed off to you: {context}."));
    }
    parts.join(" ") + "\n\n"
}

fn participants_line(participants: &[ParticipantInfo], exclude_name: &str) -> String {
    let exclude_lower = exclude_name.to_lowercase();
    participants
        .iter()
        .filter(|p| p.name.to_lowercase() != exclude_lower)
        .map(|p| {
            if !p.kind.is_empty() && p.name.to_lowercase() != p.kind.to_lowercase() {
                format!("{} ({})", p.name, capitalize(&p.kind))
            } else {
                p.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Session-specific context: participants, role, nothing static.
///
/// Static directives (Share tags, coordination tools, [PASS]) ride in the
/// CLI system prompt; this is only the dynamic per-session information.
pub fn format_session_context(
    agent_name: &str,
    participants: Option<&[ParticipantInfo]>,
    role: &str,
) -> String {
    let (label, others) = match participants {
        Some(list) => (agent_name.to_string(), participants_line(list, agent_name)),
        None => {
            let others = ROLE_DISPLAY
                .iter()
                .filter(|(key, _)| *key != agent_name && *key != "system")
                .map(|(_, label)| label.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            (role_display(agent_name), others)
        }
    };
    let role_line = if role.is_empty() {
        String::new()
    } else {
        format!("Your role: {role}\n")
    };
    format!(
        "You are {label} in a group chat with a human user and other AI agents.\n\
{role_line}Other participants: {others}."
    )
}

fn your_turn_section(current_msgs: &[HistoryMessage], agent_name: &str, round: u64) -> String {
    let mention_notice = build_mention_notice(current_msgs, agent_name);
    format!(
        "## Your Turn (Round {round})\n{mention_notice}Respond directly — no preamble about \
what you're going to do, just do it. Wrap your response in <Share> tags. \
If you have nothing meaningful to add, respond with exactly [PASS]."
    )
}

/// Per-round delta prompt for agents with active CLI sessions.
pub fn format_round_prompt(
    history: &[HistoryMessage],
    agent_name: &str,
    current_round: u64,
    extra_context: &[(String, String)],
) -> String {
    let (_, context_start) = split_history(history, current_round);
    let current_msgs = &history[context_start..];

    let mut sections: Vec<String> = extra_context
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(_, v)| v.clone())
        .collect();

    if !current_msgs.is_empty() {
        sections.push(format!(
            "## Current Round\n{}",
            format_messages(current_msgs).join("\n")
        ));
    }
    sections.push(your_turn_section(current_msgs, agent_name, current_round));
    sections.join("\n\n")
}

/// Full prompt for agents without an active CLI session.
#[allow(clippy::too_many_arguments)]
pub fn format_prompt(
    history: &[HistoryMessage],
    agent_name: &str,
    current_round: u64,
    has_session: bool,
    extra_context: &[(String, String)],
    participants: Option<&[ParticipantInfo]>,
    role: &str,
) -> String {
    let (_, context_start) = split_history(history, current_round);
    let history_msgs = &history[..context_start];
    let current_msgs = &history[context_start..];

    let mut sections = vec![format_session_context(agent_name, participants, role)];

    sections.extend(
        extra_context
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(_, v)| v.clone()),
    );

    if !history_msgs.is_empty() && !has_session {
        sections.push(format!(
            "## Conversation History\n{}",
            format_messages(history_msgs).join("\n")
        ));
    }
    if !current_msgs.is_empty() {
        sections.push(format!(
            "## Current Round\n{}",
            format_messages(current_msgs).join("\n")
        ));
    }
    sections.push(your_turn_section(current_msgs, agent_name, current_round));
    sections.join("\n\n")
}

/// Task board section for inclusion in agent prompts.
///
/// `cards` are (id, title, status, roles-held-by-agent) tuples already
/// resolved by the caller.
pub fn format_cards_section(cards: &[(String, String, String, Vec<String>)]) -> String {
    if cards.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## Task Board".to_string(),
        "Manage cards via `multiagents-cards` CLI. \
Session and URL are pre-configured in your environment."
            .to_string(),
    ];
    for (id, title, status, my_roles) in cards {
        let mut entry = format!("- [{id}] \"{title}\" ({status})");
        if !my_roles.is_empty() {
            entry.push_str(&format!(" — your role: {}", my_roles.join(", ")));
        }
        lines.push(entry);
    }
    lines.join("\n")
}

/// Format one inbox item as an incoming-event line for persistent prompts.
pub fn format_incoming_event(sender: &str, message: &str) -> String {
    match sender {
        "user" => format!("[User]: {message}"),
        "dm" => format!("[Direct message from user]: {message}"),
        "system" => format!("[System]: {message}"),
        other => format!("[{}] shared:\n{message}", capitalize(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> HistoryMessage {
        HistoryMessage::new(role, content)
    }

    fn round_msg(role: &str, content: &str, round: u64) -> HistoryMessage {
        HistoryMessage::in_round(role, content, round)
    }

    #[test]
    fn round_one_puts_everything_in_current_context() {
        let history = vec![msg("user", "hello")];
        let prompt = format_prompt(&history, "claude", 1, false, &[], None, "");
        assert!(prompt.contains("## Current Round"));
        assert!(!prompt.contains("## Conversation History"));
        assert!(prompt.contains("[User]: hello"));
        assert!(prompt.contains("Your Turn (Round 1)"));
    }

    #[test]
    fn older_rounds_split_from_current_context() {
        let history = vec![
            msg("user", "first ask"),
            round_msg("claude", "old answer", 1),
            msg("user", "second ask"),
            round_msg("claude", "new answer", 2),
        ];
        let prompt = format_prompt(&history, "codex", 3, false, &[], None, "");
        let history_idx = prompt.find("## Conversation History").unwrap();
        let current_idx = prompt.find("## Current Round").unwrap();
        assert!(history_idx < current_idx);
        assert!(prompt[current_idx..].contains("second ask"));
        assert!(prompt[current_idx..].contains("new answer"));
        assert!(!prompt[current_idx..].contains("first ask"));
    }

    #[test]
    fn session_agents_skip_history_section() {
        let history = vec![
            msg("user", "first ask"),
            round_msg("claude", "old answer", 1),
            msg("user", "second ask"),
            round_msg("claude", "new answer", 2),
        ];
        let prompt = format_prompt(&history, "codex", 3, true, &[], None, "");
        assert!(!prompt.contains("## Conversation History"));
    }

    #[test]
    fn mention_notice_names_the_mentioner_once() {
        let history = vec![
            round_msg("claude", "@codex can you check this? @codex please", 1),
            round_msg("kimi", "[HANDOFF:codex] finish the tests. Then stop.", 1),
        ];
        let prompt = format_round_prompt(&history, "codex", 2, &[]);
        assert!(prompt.contains("You were @mentioned by Claude."));
        assert!(prompt.contains("Kimi handed off to you: finish the tests."));
    }

    #[test]
    fn participants_show_type_only_when_distinct() {
        let participants = vec![
            ParticipantInfo { name: "scout".into(), kind: "claude".into() },
            ParticipantInfo { name: "codex".into(), kind: "codex".into() },
            ParticipantInfo { name: "builder".into(), kind: "kimi".into() },
        ];
        let context = format_session_context("scout", Some(&participants), "researcher");
        assert!(context.contains("You are scout"));
        assert!(context.contains("Your role: researcher"));
        assert!(context.contains("codex, builder (Kimi)"));
        assert!(!context.contains("scout (Claude)"));
    }

    #[test]
    fn default_participants_fall_back_to_known_roster() {
        let context = format_session_context("claude", None, "");
        assert!(context.contains("You are Claude"));
        assert!(context.contains("User"));
        assert!(context.contains("Codex"));
        assert!(!context.contains("System"));
    }

    #[test]
    fn incoming_event_formats_by_sender() {
        assert_eq!(format_incoming_event("user", "hi"), "[User]: hi");
        assert_eq!(
            format_incoming_event("dm", "focus"),
            "[Direct message from user]: focus"
        );
        assert_eq!(
            format_incoming_event("claude", "an idea"),
            "[Claude] shared:\nan idea"
        );
    }

    #[test]
    fn cards_section_lists_roles() {
        let cards = vec![(
            "abc123".to_string(),
            "Ship parser".to_string(),
            "planning".to_string(),
            vec!["planner".to_string()],
        )];
        let section = format_cards_section(&cards);
        assert!(section.contains("## Task Board"));
        assert!(section.contains("- [abc123] \"Ship parser\" (planning) — your role: planner"));
    }
}
