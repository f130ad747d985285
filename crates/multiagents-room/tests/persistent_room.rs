//! Persistent-mode scenarios: settlement, relay dedup, DM coalescing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{collect_until, room_with, FakeAgent};
use multiagents_room::ChatEvent;

fn spawn_room(
    room: &Arc<multiagents_room::ChatRoom>,
) -> (
    mpsc::UnboundedReceiver<ChatEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let run_room = room.clone();
    let handle = tokio::spawn(async move {
        let _ = run_room.run_persistent(None, 0, tx).await;
    });
    (rx, handle)
}

#[tokio::test]
async fn trivial_pass_settles_the_round() {
    let agent = FakeAgent::new("a", &["[PASS]"]);
    let room = room_with(vec![agent]);
    let (mut rx, handle) = spawn_room(&room);

    room.inject_user_message("ping");
    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundEnded { .. })
    })
    .await;
    room.cancel();
    let _ = handle.await;

    // Expected order: round start, user message, delivery ack, prompt,
    // stream, completion, round end (all passed).
    assert!(matches!(
        events[0],
        ChatEvent::RoundStarted { round_number: 1, .. }
    ));
    let kinds: Vec<&'static str> = events
        .iter()
        .map(|e| match e {
            ChatEvent::RoundStarted { .. } => "round_started",
            ChatEvent::UserMessageReceived { .. } => "user_message",
            ChatEvent::AgentDeliveryAcked { .. } => "delivery_acked",
            ChatEvent::AgentPromptAssembled { .. } => "agent_prompt",
            ChatEvent::AgentStreamChunk { .. } => "agent_stream",
            ChatEvent::AgentCompleted { .. } => "agent_completed",
            ChatEvent::RoundEnded { .. } => "round_ended",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "round_started",
            "user_message",
            "delivery_acked",
            "agent_prompt",
            "agent_stream",
            "agent_completed",
            "round_ended"
        ]
    );

    match &events[2] {
        ChatEvent::AgentDeliveryAcked {
            recipient, sender, ..
        } => {
            assert_eq!(recipient, "a");
            assert_eq!(sender, "user");
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match events.last().unwrap() {
        ChatEvent::RoundEnded {
            round_number,
            all_passed,
        } => {
            assert_eq!(*round_number, 1);
            assert!(all_passed);
        }
        other => panic!("expected RoundEnded, got {other:?}"),
    }
    match &events[5] {
        ChatEvent::AgentCompleted { passed, round_number, .. } => {
            assert!(passed);
            assert_eq!(*round_number, 1);
        }
        other => panic!("expected AgentCompleted, got {other:?}"),
    }

    let history = room.history_snapshot();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "ping");
    assert_eq!(history[1].role, "a");
    assert_eq!(history[1].content, "[PASS]");
    assert_eq!(history[1].round, Some(1));
}

#[tokio::test]
async fn shares_relay_once_and_dedup_suppresses_repeats() {
    // Both agents answer the user with the same share text; the repeat from
    // "a" after receiving "b"'s relay must be suppressed by the cooldown.
    let a = FakeAgent::new(
        "a",
        &[
            "<thinking>plan</thinking> <Share>use a monorepo</Share>",
            "<Share>use a monorepo</Share>",
            "[PASS]",
        ],
    );
    let b = FakeAgent::new("b", &["<Share>use a monorepo</Share>", "[PASS]", "[PASS]"]);
    let room = room_with(vec![a, b]);
    let (mut rx, handle) = spawn_room(&room);

    room.inject_user_message("design");
    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundEnded { .. })
    })
    .await;
    room.cancel();
    let _ = handle.await;

    // History stores only the extracted share, never the thinking block.
    let history = room.history_snapshot();
    let a_entries: Vec<_> = history.iter().filter(|m| m.role == "a").collect();
    assert!(!a_entries.is_empty());
    assert_eq!(a_entries[0].content, "use a monorepo");
    assert!(history
        .iter()
        .all(|m| !m.content.contains("<thinking>") && !m.content.contains("<Share>")));

    // Exactly one relay from a landed in b's inbox; the identical repeat
    // inside the cooldown window generated no second delivery.
    let relays_a_to_b = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ChatEvent::AgentDeliveryAcked { sender, recipient, .. }
                    if sender == "a" && recipient == "b"
            )
        })
        .count();
    assert_eq!(relays_a_to_b, 1);
}

#[tokio::test]
async fn dms_within_debounce_window_coalesce_into_one_turn() {
    let agent = FakeAgent::new("a", &["<Share>done</Share>"]);
    let room = room_with(vec![agent]);
    let (mut rx, handle) = spawn_room(&room);

    room.restart_agent("a", "first");
    tokio::time::sleep(Duration::from_millis(200)).await;
    room.restart_agent("a", "second");

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::AgentCompleted { .. })
    })
    .await;
    room.cancel();
    let _ = handle.await;

    let prompts: Vec<&ChatEvent> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::AgentPromptAssembled { .. }))
        .collect();
    assert_eq!(prompts.len(), 1, "coalesced DMs produce a single turn");
    match prompts[0] {
        ChatEvent::AgentPromptAssembled { sections, .. } => {
            let prompt = &sections["message"];
            assert!(prompt.contains("Direct Message from User"));
            assert!(prompt.contains("first\nsecond"));
        }
        _ => unreachable!(),
    }

    let dm_acks = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::AgentDeliveryAcked { sender, .. } if sender == "dm"))
        .count();
    assert_eq!(dm_acks, 1);
}

#[tokio::test]
async fn consensus_closes_the_round_until_new_input() {
    let a = FakeAgent::new("a", &["[PASS]", "[PASS]"]);
    let b = FakeAgent::new("b", &["[PASS]", "[PASS]"]);
    let room = room_with(vec![a, b]);
    let (mut rx, handle) = spawn_room(&room);

    room.inject_user_message("anything to add?");
    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundEnded { all_passed: true, .. })
    })
    .await;
    assert!(!events.is_empty());

    // Pass storm: round closed, no further events until external input.
    let quiet = collect_until(&mut rx, Duration::from_millis(500), |_| true).await;
    assert!(quiet.is_empty(), "no activity after consensus, got {quiet:?}");

    // New user input reopens the round (same number, already advanced).
    room.inject_user_message("more work");
    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundStarted { .. })
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::RoundStarted { round_number: 2, .. })));

    room.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn stopped_agent_reports_partial_and_pauses_round() {
    let slow = common::SlowAgent::new("slow", Duration::from_secs(2));
    let fast = FakeAgent::new("fast", &["[PASS]"]);
    let room = room_with(vec![slow, fast]);
    let (mut rx, handle) = spawn_room(&room);

    room.inject_user_message("go");
    tokio::time::sleep(Duration::from_millis(120)).await;
    room.stop_agent("slow");

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundPaused { .. })
    })
    .await;

    let stopped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::AgentCompleted {
                agent_name,
                stopped: true,
                response,
                ..
            } => Some((agent_name.clone(), response.response.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].0, "slow");
    assert!(stopped[0].1.contains("chunk"), "partial text retained");

    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::RoundEnded { all_passed: false, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::RoundPaused { .. })));

    // resume() releases the pause and the next round opens.
    room.resume();
    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, ChatEvent::RoundStarted { .. })
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::RoundStarted { round_number: 2, .. })));

    room.cancel();
    let _ = handle.await;
}
