//! Round-batched mode scenarios: consensus, history filtering, stops, DMs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{collect_until, room_with, FakeAgent, SlowAgent, TwoPhaseAgent};
use multiagents_room::{ChatEvent, PRIVATE_PLACEHOLDER};

fn spawn_room(
    room: &Arc<multiagents_room::ChatRoom>,
    initial_prompt: &str,
) -> (
    mpsc::UnboundedReceiver<ChatEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let run_room = room.clone();
    let prompt = initial_prompt.to_string();
    let handle = tokio::spawn(async move {
        let _ = run_room.run(Some(prompt), 0, tx).await;
    });
    (rx, handle)
}

#[tokio::test]
async fn all_pass_ends_discussion() {
    let agents: Vec<Arc<dyn multiagents_agent::Participant>> = vec![
        FakeAgent::new("claude", &["Hello!", "[PASS]"]),
        FakeAgent::new("codex", &["Hi!", "[PASS]"]),
        FakeAgent::new("kimi", &["Hey!", "[PASS]"]),
    ];
    let room = room_with(agents);
    let (mut rx, handle) = spawn_room(&room, "Build an API");

    let events = collect_until(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::DiscussionEnded { .. })
    })
    .await;
    let _ = handle.await;

    // Round 1: real content from everyone; round 2: unanimous pass.
    let ended: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::DiscussionEnded { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ended, vec!["all_passed"]);

    let rounds: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::RoundStarted { round_number, .. } => Some(*round_number),
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![1, 2]);
}

#[tokio::test]
async fn share_tags_filter_history() {
    let agents: Vec<Arc<dyn multiagents_agent::Participant>> = vec![
        FakeAgent::new("claude", &["<Share>Public info</Share> private stuff", "[PASS]"]),
        FakeAgent::new("codex", &["Got it", "[PASS]"]),
    ];
    let room = room_with(agents);
    let (mut rx, handle) = spawn_room(&room, "Test");

    collect_until(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::DiscussionEnded { .. })
    })
    .await;
    let _ = handle.await;

    let history = room.history_snapshot();
    let claude_msgs: Vec<_> = history.iter().filter(|m| m.role == "claude").collect();
    assert_eq!(claude_msgs.len(), 2);
    assert_eq!(claude_msgs[0].content, "Public info");
    assert!(!claude_msgs[0].content.contains("private stuff"));
    assert_eq!(claude_msgs[0].round, Some(1));
    assert_eq!(claude_msgs[1].content, "[PASS]");
    assert_eq!(claude_msgs[1].round, Some(2));

    // No tags at all -> placeholder.
    let codex_msgs: Vec<_> = history.iter().filter(|m| m.role == "codex").collect();
    assert_eq!(codex_msgs[0].content, PRIVATE_PLACEHOLDER);
}

#[tokio::test]
async fn stopping_one_agent_leaves_others_alone() {
    let slow = SlowAgent::new("claude", Duration::from_secs(2));
    let fast = FakeAgent::new("codex", &["Done!", "[PASS]"]);
    let room = room_with(vec![slow, fast]);
    let (mut rx, handle) = spawn_room(&room, "test");

    let stopper = {
        let room = room.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            room.stop_agent("claude");
        })
    };

    let events = collect_until(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::RoundEnded { .. })
    })
    .await;
    stopper.await.unwrap();
    room.cancel();
    let _ = handle.await;

    let completions: Vec<(String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::AgentCompleted {
                agent_name,
                stopped,
                ..
            } => Some((agent_name.clone(), *stopped)),
            _ => None,
        })
        .collect();
    assert_eq!(completions.len(), 2);
    assert!(completions.contains(&("claude".to_string(), true)));
    assert!(completions.contains(&("codex".to_string(), false)));
}

#[tokio::test]
async fn stop_round_without_pause_lets_agents_rejoin() {
    let agents: Vec<Arc<dyn multiagents_agent::Participant>> = vec![
        TwoPhaseAgent::new("claude", Duration::from_secs(2)),
        TwoPhaseAgent::new("codex", Duration::from_secs(2)),
    ];
    let room = room_with(agents);
    let (mut rx, handle) = spawn_room(&room, "test");

    {
        let room = room.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            room.stop_round(false);
        });
    }

    // Round 1 ends with both stopped; round 2 starts immediately (no pause)
    // and both agents pass (their scripts are exhausted), ending everything.
    let events = collect_until(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::DiscussionEnded { .. })
    })
    .await;
    let _ = handle.await;

    assert!(!events
        .iter()
        .any(|e| matches!(e, ChatEvent::RoundPaused { .. })));
    let rounds: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::RoundStarted { round_number, .. } => Some(*round_number),
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![1, 2]);
}

#[tokio::test]
async fn dm_rewinds_a_completed_agent_in_the_same_round() {
    // "codex" completes instantly, then a DM arrives: its completion is
    // replaced (AgentInterrupted) and the DM prompt reruns in round 1.
    let claude = SlowAgent::new("claude", Duration::from_secs(2));
    let codex = FakeAgent::new("codex", &["quick answer", "<Share>dm answer</Share>", "[PASS]"]);
    let room = room_with(vec![claude, codex]);
    let (mut rx, handle) = spawn_room(&room, "test");

    {
        let room = room.clone();
        tokio::spawn(async move {
            // After codex completed but while claude still runs.
            tokio::time::sleep(Duration::from_millis(200)).await;
            room.restart_agent("codex", "focus on the schema");
        });
    }

    let events = collect_until(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::RoundEnded { .. })
    })
    .await;
    room.cancel();
    let _ = handle.await;

    let interrupted: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::AgentInterrupted {
                agent_name,
                round_number,
                partial_text,
            } => Some((agent_name.clone(), *round_number, partial_text.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].0, "codex");
    assert_eq!(interrupted[0].1, 1);
    assert_eq!(interrupted[0].2, "quick answer");

    // Both the original completion and the rerun land in round 1, with the
    // interruption in between.
    let codex_completions: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::AgentCompleted {
                agent_name,
                round_number,
                ..
            } if agent_name == "codex" => Some(*round_number),
            _ => None,
        })
        .collect();
    assert_eq!(codex_completions, vec![1, 1]);

    let history = room.history_snapshot();
    let codex_entry = history.iter().find(|m| m.role == "codex").unwrap();
    assert_eq!(codex_entry.content, "dm answer");
}
