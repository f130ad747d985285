//! Round-batched dispatch: every agent gets a full prompt each round and
//! the room waits for all of them before advancing. A stopped (or freshly
//! completed) agent with a pending DM is rewound and rerun with the DM as
//! its prompt for the same round.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use multiagents_agent::{AgentChunk, AgentResponse, Participant};
use multiagents_core::HistoryMessage;

use crate::error::{Result, RoomError};
use crate::events::ChatEvent;
use crate::prompts::{format_prompt, format_round_prompt, format_session_context};
use crate::room::{failed_response, ChatRoom};
use crate::share::{detect_pass, extract_shareable};

const PUMP_POLL: Duration = Duration::from_millis(100);
/// Grace added on top of the per-agent budgets before a round is abandoned.
const ROUND_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RoundShared {
    responses: Mutex<HashMap<String, AgentResponse>>,
    passed: Mutex<HashMap<String, bool>>,
}

type EventTx = mpsc::UnboundedSender<Option<ChatEvent>>;

impl ChatRoom {
    /// Run round-batched mode until consensus ([PASS] from everyone), the
    /// subscriber disconnects, or the room is cancelled.
    pub async fn run(
        self: &Arc<Self>,
        initial_prompt: Option<String>,
        start_round: u64,
        out: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()> {
        if let Some(prompt) = &initial_prompt {
            self.history
                .lock()
                .unwrap()
                .push(HistoryMessage::new("user", prompt.clone()));
        }
        let mut round_number = start_round;

        loop {
            if self.cancel.is_cancelled() {
                info!("round session cancelled");
                return Ok(());
            }

            // User/system injections land between rounds.
            loop {
                let Some(text) = self.user_queue.lock().unwrap().pop_front() else {
                    break;
                };
                self.history
                    .lock()
                    .unwrap()
                    .push(HistoryMessage::new("user", text.clone()));
                if out.send(ChatEvent::UserMessageReceived { text }).is_err() {
                    return Err(RoomError::SubscriberGone);
                }
            }
            loop {
                let Some(text) = self.system_queue.lock().unwrap().pop_front() else {
                    break;
                };
                self.history
                    .lock()
                    .unwrap()
                    .push(HistoryMessage::new("system", text.clone()));
                if out
                    .send(ChatEvent::AgentNotice {
                        agent_name: "system".to_string(),
                        message: text,
                    })
                    .is_err()
                {
                    return Err(RoomError::SubscriberGone);
                }
            }

            round_number += 1;
            self.any_stopped.store(false, Ordering::SeqCst);
            self.pause_on_stop.store(true, Ordering::SeqCst);

            let round_agents: Vec<Arc<dyn Participant>> = self.agents.lock().unwrap().clone();
            let names: Vec<String> = round_agents.iter().map(|a| a.name().to_string()).collect();
            if out
                .send(ChatEvent::RoundStarted {
                    round_number,
                    agents: names.clone(),
                })
                .is_err()
            {
                return Err(RoomError::SubscriberGone);
            }

            self.reset_all_stop_tokens(&names);
            self.drain_restart_queue();

            let shared = Arc::new(RoundShared::default());
            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Option<ChatEvent>>();

            let mut tasks: Vec<JoinHandle<()>> = round_agents
                .iter()
                .map(|agent| {
                    spawn_round_agent(
                        self.clone(),
                        agent.clone(),
                        None,
                        round_number,
                        event_tx.clone(),
                        shared.clone(),
                    )
                })
                .collect();

            let mut total = round_agents.len();
            let mut done_count: usize = 0;
            let mut pending_restarts: HashMap<String, String> = HashMap::new();
            let mut deferred_stops: HashMap<String, ChatEvent> = HashMap::new();

            let max_parse = round_agents
                .iter()
                .map(|a| a.parse_timeout())
                .max()
                .unwrap_or(Duration::ZERO);
            let max_hard = round_agents
                .iter()
                .filter_map(|a| a.hard_timeout())
                .max()
                .unwrap_or(Duration::ZERO);
            let round_timeout = self.timeout.max(max_hard) + max_parse + ROUND_GRACE;
            let deadline = tokio::time::Instant::now() + round_timeout;

            while done_count < total {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    warn!(round = round_number, "round timed out waiting for agents");
                    break;
                }
                let remaining = deadline - now;

                // Mid-round joins.
                loop {
                    let Some(agent) = self.add_queue.lock().unwrap().pop_front() else {
                        break;
                    };
                    self.agents.lock().unwrap().push(agent.clone());
                    self.reset_stop_token(agent.name());
                    tasks.push(spawn_round_agent(
                        self.clone(),
                        agent,
                        None,
                        round_number,
                        event_tx.clone(),
                        shared.clone(),
                    ));
                    total += 1;
                }

                // Mid-round removals. A removed agent that already finished
                // is dropped from tracking; a running one was stopped by
                // remove_agent() and only shrinks the expected total.
                loop {
                    let Some(name) = self.remove_queue.lock().unwrap().pop_front() else {
                        break;
                    };
                    self.agents.lock().unwrap().retain(|a| a.name() != name);
                    let had_response = shared.responses.lock().unwrap().remove(&name).is_some();
                    shared.passed.lock().unwrap().remove(&name);
                    if had_response {
                        done_count = done_count.saturating_sub(1);
                    }
                    total = total.saturating_sub(1);
                }

                // Fired DM debounces become pending restarts.
                self.fire_due_dm_buffers();
                loop {
                    let Some((name, dm_text)) = self.restart_queue.lock().unwrap().pop_front()
                    else {
                        break;
                    };
                    pending_restarts.insert(name, dm_text);
                }

                // Agents that completed before their DM arrived are rewound:
                // their AgentCompleted already went out, so the event-driven
                // path below can never fire for them.
                let already_done: Vec<String> = pending_restarts
                    .keys()
                    .filter(|name| shared.responses.lock().unwrap().contains_key(*name))
                    .cloned()
                    .collect();
                for name in already_done {
                    let Some(dm_text) = pending_restarts.remove(&name) else {
                        continue;
                    };
                    let partial = shared
                        .responses
                        .lock()
                        .unwrap()
                        .remove(&name)
                        .map(|r| r.response)
                        .unwrap_or_default();
                    shared.passed.lock().unwrap().remove(&name);
                    done_count = done_count.saturating_sub(1);
                    if out
                        .send(ChatEvent::AgentInterrupted {
                            agent_name: name.clone(),
                            round_number,
                            partial_text: partial,
                        })
                        .is_err()
                    {
                        abort_all(&tasks);
                        return Err(RoomError::SubscriberGone);
                    }
                    if let Some(agent) = self.find_agent(&name) {
                        self.reset_stop_token(&name);
                        tasks.push(spawn_round_agent(
                            self.clone(),
                            agent,
                            Some(dm_text),
                            round_number,
                            event_tx.clone(),
                            shared.clone(),
                        ));
                    }
                }

                let event = tokio::time::timeout(PUMP_POLL.min(remaining), event_rx.recv()).await;
                let event = match event {
                    Err(_) => {
                        let has_pending = !pending_restarts.is_empty()
                            || self.dm_buffers_pending()
                            || !deferred_stops.is_empty();
                        if tasks.iter().all(|t| t.is_finished()) && !has_pending {
                            match event_rx.try_recv() {
                                Ok(ev) => ev,
                                Err(_) => break,
                            }
                        } else {
                            // Release deferred stops whose debounce fired.
                            let ready: Vec<String> = deferred_stops
                                .keys()
                                .filter(|name| pending_restarts.contains_key(*name))
                                .cloned()
                                .collect();
                            for name in ready {
                                if let Some(ev) = deferred_stops.remove(&name) {
                                    let _ = event_tx.send(Some(ev));
                                }
                            }
                            continue;
                        }
                    }
                    Ok(ev) => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                };
                let Some(event) = event else {
                    break;
                };

                // A completion racing a DM (stopped or not) is rewound so
                // the DM replaces the agent's turn in this same round.
                if let ChatEvent::AgentCompleted {
                    agent_name,
                    response,
                    ..
                } = &event
                {
                    let dm_text = if pending_restarts.contains_key(agent_name) {
                        pending_restarts.remove(agent_name)
                    } else if self.dm_buffer_pending_for(agent_name) {
                        // Debounce hasn't fired yet — defer until it does.
                        deferred_stops.insert(agent_name.clone(), event.clone());
                        continue;
                    } else {
                        None
                    };

                    if let Some(dm_text) = dm_text {
                        if out
                            .send(ChatEvent::AgentInterrupted {
                                agent_name: agent_name.clone(),
                                round_number,
                                partial_text: response.response.clone(),
                            })
                            .is_err()
                        {
                            abort_all(&tasks);
                            return Err(RoomError::SubscriberGone);
                        }
                        shared.responses.lock().unwrap().remove(agent_name);
                        shared.passed.lock().unwrap().remove(agent_name);
                        if let Some(agent) = self.find_agent(agent_name) {
                            self.reset_stop_token(agent_name);
                            tasks.push(spawn_round_agent(
                                self.clone(),
                                agent,
                                Some(dm_text),
                                round_number,
                                event_tx.clone(),
                                shared.clone(),
                            ));
                        }
                        continue;
                    }
                }

                let completion = matches!(event, ChatEvent::AgentCompleted { .. });
                let was_stopped =
                    matches!(&event, ChatEvent::AgentCompleted { stopped: true, .. });
                if out.send(event).is_err() {
                    abort_all(&tasks);
                    return Err(RoomError::SubscriberGone);
                }
                if completion {
                    done_count += 1;
                    if was_stopped {
                        self.any_stopped.store(true, Ordering::SeqCst);
                    }
                }
            }

            if done_count < total {
                abort_all(&tasks);
                // Flush whatever completions made it into the queue.
                while let Ok(Some(event)) = event_rx.try_recv() {
                    let completion = matches!(event, ChatEvent::AgentCompleted { .. });
                    if out.send(event).is_err() {
                        return Err(RoomError::SubscriberGone);
                    }
                    if completion {
                        done_count += 1;
                    }
                }
                let current: Vec<String> = self.agent_names();
                for name in current {
                    if !shared.responses.lock().unwrap().contains_key(&name) {
                        let response =
                            failed_response(&name, "Agent did not complete before timeout");
                        shared
                            .responses
                            .lock()
                            .unwrap()
                            .insert(name.clone(), response.clone());
                        shared.passed.lock().unwrap().insert(name.clone(), false);
                        if out
                            .send(ChatEvent::AgentCompleted {
                                agent_name: name,
                                round_number,
                                response,
                                passed: false,
                                stopped: false,
                            })
                            .is_err()
                        {
                            return Err(RoomError::SubscriberGone);
                        }
                    }
                }
            }
            drop(event_tx);

            // Stop events and debounce buffers never outlive the round.
            self.stop_tokens.lock().unwrap().clear();
            self.clear_dm_buffers();

            // Record non-pass responses with only their shareable content.
            let mut all_passed = true;
            {
                let responses = shared.responses.lock().unwrap();
                let passed = shared.passed.lock().unwrap();
                let mut history = self.history.lock().unwrap();
                for agent in self.agents.lock().unwrap().iter() {
                    let name = agent.name();
                    let Some(response) = responses.get(name) else {
                        continue;
                    };
                    if passed.get(name).copied().unwrap_or(false) {
                        history.push(HistoryMessage::in_round(name, "[PASS]", round_number));
                    } else {
                        let shareable = extract_shareable(&response.response);
                        history.push(HistoryMessage::in_round(name, shareable, round_number));
                        all_passed = false;
                    }
                }
            }

            if out
                .send(ChatEvent::RoundEnded {
                    round_number,
                    all_passed,
                })
                .is_err()
            {
                return Err(RoomError::SubscriberGone);
            }

            // Between-round roster changes.
            loop {
                let Some(agent) = self.add_queue.lock().unwrap().pop_front() else {
                    break;
                };
                self.agents.lock().unwrap().push(agent);
            }
            loop {
                let Some(name) = self.remove_queue.lock().unwrap().pop_front() else {
                    break;
                };
                self.agents.lock().unwrap().retain(|a| a.name() != name);
            }

            if all_passed {
                let _ = out.send(ChatEvent::DiscussionEnded {
                    reason: "all_passed".to_string(),
                });
                return Ok(());
            }

            if self.any_stopped.load(Ordering::SeqCst) && self.pause_on_stop.load(Ordering::SeqCst)
            {
                self.any_stopped.store(false, Ordering::SeqCst);
                self.resume_flag.store(false, Ordering::SeqCst);
                if out
                    .send(ChatEvent::RoundPaused { round_number })
                    .is_err()
                {
                    return Err(RoomError::SubscriberGone);
                }
                loop {
                    if self.cancel.is_cancelled()
                        || self.resume_flag.load(Ordering::SeqCst)
                        || !self.user_queue.lock().unwrap().is_empty()
                        || !self.system_queue.lock().unwrap().is_empty()
                    {
                        break;
                    }
                    tokio::time::sleep(PUMP_POLL).await;
                }
                self.resume_flag.store(false, Ordering::SeqCst);
            }

            if !self.user_queue.lock().unwrap().is_empty()
                || !self.system_queue.lock().unwrap().is_empty()
            {
                continue;
            }

            // Small window for user injection before the next round fires.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn find_agent(&self, name: &str) -> Option<Arc<dyn Participant>> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }
}

fn abort_all(tasks: &[JoinHandle<()>]) {
    for task in tasks {
        task.abort();
    }
}

fn spawn_round_agent(
    room: Arc<ChatRoom>,
    agent: Arc<dyn Participant>,
    prompt_override: Option<String>,
    round_number: u64,
    event_tx: EventTx,
    shared: Arc<RoundShared>,
) -> JoinHandle<()> {
    tokio::spawn(run_round_agent(
        room,
        agent,
        prompt_override,
        round_number,
        event_tx,
        shared,
    ))
}

/// One agent's turn within a batched round.
async fn run_round_agent(
    room: Arc<ChatRoom>,
    agent: Arc<dyn Participant>,
    prompt_override: Option<String>,
    round_number: u64,
    event_tx: EventTx,
    shared: Arc<RoundShared>,
) {
    let name = agent.name().to_string();

    let prompt = match &prompt_override {
        Some(dm_text) => format!(
            "## Direct Message from User\n{dm_text}\n\n\
Respond to this directive. If you have nothing to add, respond with [PASS]."
        ),
        None => {
            let extra = room
                .context_provider
                .as_ref()
                .map(|provider| provider(&name))
                .unwrap_or_default();
            let role = room.roles.get(&name).cloned().unwrap_or_default();
            let history = room.history_snapshot();
            let has_session = agent.session_id().is_some();

            let prompt = if has_session {
                // Active CLI session: send only the round delta.
                format_round_prompt(&history, &name, round_number, &extra)
            } else {
                format_prompt(
                    &history,
                    &name,
                    round_number,
                    false,
                    &extra,
                    room.participants.as_deref(),
                    &role,
                )
            };

            let mut sections: HashMap<String, String> =
                extra.iter().cloned().collect();
            if !has_session {
                sections.insert(
                    "system".to_string(),
                    format_session_context(&name, room.participants.as_deref(), &role),
                );
            }
            sections.insert(
                "round_delta".to_string(),
                format_round_prompt(&history, &name, round_number, &[]),
            );
            let _ = event_tx.send(Some(ChatEvent::AgentPromptAssembled {
                agent_name: name.clone(),
                round_number,
                sections,
            }));

            prompt
        }
    };

    let stop = room.stop_token(&name);
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<AgentChunk>();
    let stream_agent = agent.clone();
    let stream_prompt = prompt.clone();
    let stream_timeout = room.timeout;
    let stream_task = tokio::spawn(async move {
        stream_agent
            .stream(&stream_prompt, stream_timeout, chunk_tx)
            .await;
    });

    let mut partial = String::new();
    let mut was_stopped = false;

    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    if handle_round_chunk(
                        chunk, &name, round_number, &mut partial, &event_tx, &shared,
                    ) {
                        break;
                    }
                }
                None => break,
            },
            _ = stop.cancelled() => { was_stopped = true; break; }
        }
    }

    if was_stopped {
        agent.cancel_turn().await;
        stream_task.abort();
        // The stream may have delivered its response just as the stop fired.
        while let Ok(chunk) = chunk_rx.try_recv() {
            handle_round_chunk(chunk, &name, round_number, &mut partial, &event_tx, &shared);
        }
        if !shared.responses.lock().unwrap().contains_key(&name) {
            let partial_text = if partial.trim().is_empty() {
                "(stopped)".to_string()
            } else {
                partial.trim().to_string()
            };
            let response = failed_response(&name, partial_text);
            shared
                .responses
                .lock()
                .unwrap()
                .insert(name.clone(), response.clone());
            shared.passed.lock().unwrap().insert(name.clone(), false);
            let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                agent_name: name.clone(),
                round_number,
                response,
                passed: false,
                stopped: true,
            }));
            return;
        }
    } else {
        match stream_task.await {
            Err(join_err) if join_err.is_panic() => {
                debug!(agent = %name, "round agent stream panicked");
            }
            _ => {}
        }
    }

    // Guarantee a completion even if the stream ended silently.
    if !shared.responses.lock().unwrap().contains_key(&name) {
        let response = failed_response(&name, "Agent did not produce a response");
        shared
            .responses
            .lock()
            .unwrap()
            .insert(name.clone(), response.clone());
        shared.passed.lock().unwrap().insert(name.clone(), false);
        let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
            agent_name: name,
            round_number,
            response,
            passed: false,
            stopped: false,
        }));
    }
}

/// Forward one chunk; returns true once the terminal response was recorded.
fn handle_round_chunk(
    chunk: AgentChunk,
    name: &str,
    round_number: u64,
    partial: &mut String,
    event_tx: &EventTx,
    shared: &RoundShared,
) -> bool {
    match chunk {
        AgentChunk::Text(text) => {
            partial.push_str(&text);
            let _ = event_tx.send(Some(ChatEvent::AgentStreamChunk {
                agent_name: name.to_string(),
                round_number,
                text,
            }));
            false
        }
        AgentChunk::Notice(notice) => {
            let _ = event_tx.send(Some(ChatEvent::AgentNotice {
                agent_name: notice.agent,
                message: notice.message,
            }));
            false
        }
        AgentChunk::Permission(request) => {
            let _ = event_tx.send(Some(ChatEvent::AgentPermissionRequested {
                agent_name: request.agent,
                round_number,
                request_id: request.request_id,
                tool_name: request.tool_name,
                tool_input: request.tool_input,
                description: request.description,
            }));
            false
        }
        AgentChunk::Response(response) => {
            let is_pass = detect_pass(&response.response);
            shared
                .responses
                .lock()
                .unwrap()
                .insert(name.to_string(), response.clone());
            shared.passed.lock().unwrap().insert(name.to_string(), is_pass);
            if let Some(stderr) = &response.stderr {
                let _ = event_tx.send(Some(ChatEvent::AgentStderr {
                    agent_name: name.to_string(),
                    round_number,
                    text: stderr.clone(),
                }));
            }
            let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                agent_name: name.to_string(),
                round_number,
                response,
                passed: is_pass,
                stopped: false,
            }));
            true
        }
    }
}
