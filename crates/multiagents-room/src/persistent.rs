//! Real-time message-passing mode for persistent pipe agents.
//!
//! Each agent has an inbox and a dedicated loop; shares are relayed to peer
//! inboxes as they appear. Rounds are implicit: a round settles when all
//! agents are idle and every inbox is empty; non-consensus settlements
//! immediately open the next round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use multiagents_agent::{AgentChunk, AgentResponse, Participant};
use multiagents_core::HistoryMessage;

use crate::error::{Result, RoomError};
use crate::events::ChatEvent;
use crate::room::{failed_response, ChatRoom, Inbox, InboxItem};
use crate::share::{detect_pass, extract_shareable, PRIVATE_PLACEHOLDER};

const INBOX_POLL: Duration = Duration::from_millis(200);
const PUMP_POLL: Duration = Duration::from_millis(100);

/// Round/idle bookkeeping shared between the pump and agent loops.
pub(crate) struct PersistentState {
    pub round_number: u64,
    pub agent_idle: HashMap<String, bool>,
    pub agent_passed: HashMap<String, bool>,
    pub agent_initialized: HashMap<String, bool>,
    pub settlement_signaled: bool,
    pub round_has_activity: bool,
    pub round_open: bool,
}

type EventTx = mpsc::UnboundedSender<Option<ChatEvent>>;

impl ChatRoom {
    /// Run persistent mode, sending events to `out` until the room is
    /// cancelled or the subscriber goes away.
    pub async fn run_persistent(
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

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Option<ChatEvent>>();
        let agents: Vec<Arc<dyn Participant>> = self.agents.lock().unwrap().clone();
        let names: Vec<String> = agents.iter().map(|a| a.name().to_string()).collect();
        self.reset_all_stop_tokens(&names);

        let state = Arc::new(Mutex::new(PersistentState {
            round_number: start_round + 1,
            agent_idle: names.iter().map(|n| (n.clone(), false)).collect(),
            agent_passed: names.iter().map(|n| (n.clone(), false)).collect(),
            agent_initialized: names.iter().map(|n| (n.clone(), false)).collect(),
            settlement_signaled: false,
            round_has_activity: false,
            round_open: true,
        }));

        // Wire inboxes first, then spawn one loop per agent.
        let mut receivers = Vec::new();
        {
            let mut inboxes = self.inboxes.lock().unwrap();
            inboxes.clear();
            for agent in &agents {
                let (tx, rx) = mpsc::unbounded_channel();
                let depth = Arc::new(AtomicUsize::new(0));
                inboxes.insert(agent.name().to_string(), Inbox { tx, depth: depth.clone() });
                receivers.push((agent.clone(), rx, depth));
            }
        }
        let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();
        for (agent, rx, depth) in receivers {
            tasks.insert(
                agent.name().to_string(),
                spawn_agent_loop(self.clone(), agent, rx, depth, state.clone(), event_tx.clone()),
            );
        }

        // Seed: the explicit prompt, or the last user message from history.
        let seed_text = initial_prompt.or_else(|| {
            self.history
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
        });
        if let Some(seed) = seed_text {
            let round = state.lock().unwrap().round_number;
            self.enqueue_delivery("user", &seed, Some(round), &names);
            state.lock().unwrap().round_has_activity = true;
        }

        self.any_stopped.store(false, Ordering::SeqCst);
        self.pause_on_stop.store(true, Ordering::SeqCst);
        let first_round = state.lock().unwrap().round_number;
        if out
            .send(ChatEvent::RoundStarted {
                round_number: first_round,
                agents: names.clone(),
            })
            .is_err()
        {
            self.finish_persistent(tasks);
            return Err(RoomError::SubscriberGone);
        }

        let outcome = loop {
            if self.cancel.is_cancelled() {
                info!("persistent session cancelled");
                break Ok(());
            }
            if let Err(e) = self.pump_control_queues(&state, &event_tx, &out, &mut tasks) {
                break Err(e);
            }

            let received = tokio::time::timeout(PUMP_POLL, event_rx.recv()).await;
            match received {
                Err(_) => continue,
                Ok(None) => break Ok(()),
                Ok(Some(Some(event))) => {
                    if out.send(event).is_err() {
                        break Err(RoomError::SubscriberGone);
                    }
                }
                Ok(Some(None)) => {
                    // Settlement marker: close out the round.
                    if let Err(e) = self.handle_settlement(&state, &out).await {
                        break Err(e);
                    }
                }
            }
        };

        self.finish_persistent(tasks);
        outcome
    }

    /// Drain user/system/DM/add/remove queues into deliveries and spawns.
    /// Err means the subscriber disconnected.
    fn pump_control_queues(
        self: &Arc<Self>,
        state: &Arc<Mutex<PersistentState>>,
        event_tx: &EventTx,
        out: &mpsc::UnboundedSender<ChatEvent>,
        tasks: &mut HashMap<String, JoinHandle<()>>,
    ) -> Result<()> {
        // User broadcasts.
        loop {
            let Some(text) = self.user_queue.lock().unwrap().pop_front() else {
                break;
            };
            self.reopen_round_if_closed(state, out)?;
            self.history
                .lock()
                .unwrap()
                .push(HistoryMessage::new("user", text.clone()));
            out.send(ChatEvent::UserMessageReceived { text: text.clone() })
                .map_err(|_| RoomError::SubscriberGone)?;
            let round = {
                let mut s = state.lock().unwrap();
                s.settlement_signaled = false;
                s.round_has_activity = true;
                for idle in s.agent_idle.values_mut() {
                    *idle = false;
                }
                for passed in s.agent_passed.values_mut() {
                    *passed = false;
                }
                s.round_number
            };
            self.enqueue_delivery("user", &text, Some(round), &self.agent_names());
        }

        // System broadcasts.
        loop {
            let Some(text) = self.system_queue.lock().unwrap().pop_front() else {
                break;
            };
            self.reopen_round_if_closed(state, out)?;
            self.history
                .lock()
                .unwrap()
                .push(HistoryMessage::new("system", text.clone()));
            out.send(ChatEvent::AgentNotice {
                agent_name: "system".to_string(),
                message: text.clone(),
            })
            .map_err(|_| RoomError::SubscriberGone)?;
            let round = {
                let mut s = state.lock().unwrap();
                s.settlement_signaled = false;
                s.round_has_activity = true;
                for idle in s.agent_idle.values_mut() {
                    *idle = false;
                }
                for passed in s.agent_passed.values_mut() {
                    *passed = false;
                }
                s.round_number
            };
            self.enqueue_delivery("system", &text, Some(round), &self.agent_names());
        }

        // Debounced DMs.
        self.fire_due_dm_buffers();
        loop {
            let Some((name, dm_text)) = self.restart_queue.lock().unwrap().pop_front() else {
                break;
            };
            if !self.inboxes.lock().unwrap().contains_key(&name) {
                continue;
            }
            self.reopen_round_if_closed(state, out)?;
            let round = {
                let mut s = state.lock().unwrap();
                s.agent_idle.insert(name.clone(), false);
                s.agent_passed.insert(name.clone(), false);
                s.settlement_signaled = false;
                s.round_has_activity = true;
                s.round_number
            };
            self.enqueue_delivery("dm", &dm_text, Some(round), std::slice::from_ref(&name));
        }

        // Joins: seed the newcomer with the last user message for context.
        loop {
            let Some(agent) = self.add_queue.lock().unwrap().pop_front() else {
                break;
            };
            let name = agent.name().to_string();
            self.agents.lock().unwrap().push(agent.clone());
            let (tx, rx) = mpsc::unbounded_channel();
            let depth = Arc::new(AtomicUsize::new(0));
            self.inboxes
                .lock()
                .unwrap()
                .insert(name.clone(), Inbox { tx: tx.clone(), depth: depth.clone() });
            {
                let mut s = state.lock().unwrap();
                s.agent_idle.insert(name.clone(), false);
                s.agent_passed.insert(name.clone(), false);
                s.agent_initialized.insert(name.clone(), false);
            }
            self.reset_stop_token(&name);

            let last_user_msg = self
                .history
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone());
            if let Some(message) = last_user_msg {
                self.reopen_round_if_closed(state, out)?;
                let round = {
                    let mut s = state.lock().unwrap();
                    s.settlement_signaled = false;
                    s.round_has_activity = true;
                    s.round_number
                };
                depth.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(InboxItem {
                    sender: "user".to_string(),
                    message,
                    round: Some(round),
                    delivery_id: None,
                });
            }
            tasks.insert(
                name,
                spawn_agent_loop(self.clone(), agent, rx, depth, state.clone(), event_tx.clone()),
            );
        }

        // Removals.
        loop {
            let Some(name) = self.remove_queue.lock().unwrap().pop_front() else {
                break;
            };
            self.agents.lock().unwrap().retain(|a| a.name() != name);
            self.inboxes.lock().unwrap().remove(&name);
            {
                let mut s = state.lock().unwrap();
                s.agent_idle.remove(&name);
                s.agent_passed.remove(&name);
                s.agent_initialized.remove(&name);
            }
            self.drop_agent_pending_deliveries(&name);
            if let Some(token) = self.stop_tokens.lock().unwrap().remove(&name) {
                token.cancel();
            }
            if let Some(task) = tasks.remove(&name) {
                task.abort();
            }
        }

        Ok(())
    }

    fn reopen_round_if_closed(
        &self,
        state: &Arc<Mutex<PersistentState>>,
        out: &mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()> {
        let round = {
            let mut s = state.lock().unwrap();
            if s.round_open {
                return Ok(());
            }
            s.round_open = true;
            s.round_number
        };
        self.any_stopped.store(false, Ordering::SeqCst);
        self.pause_on_stop.store(true, Ordering::SeqCst);
        out.send(ChatEvent::RoundStarted {
            round_number: round,
            agents: self.agent_names(),
        })
        .map_err(|_| RoomError::SubscriberGone)
    }

    async fn handle_settlement(
        self: &Arc<Self>,
        state: &Arc<Mutex<PersistentState>>,
        out: &mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()> {
        let (round, all_passed) = {
            let s = state.lock().unwrap();
            (s.round_number, s.agent_passed.values().all(|p| *p))
        };
        out.send(ChatEvent::RoundEnded {
            round_number: round,
            all_passed,
        })
        .map_err(|_| RoomError::SubscriberGone)?;

        if self.any_stopped.load(Ordering::SeqCst) && self.pause_on_stop.load(Ordering::SeqCst) {
            self.any_stopped.store(false, Ordering::SeqCst);
            self.resume_flag.store(false, Ordering::SeqCst);
            out.send(ChatEvent::RoundPaused { round_number: round })
                .map_err(|_| RoomError::SubscriberGone)?;
            loop {
                if self.cancel.is_cancelled()
                    || self.resume_flag.load(Ordering::SeqCst)
                    || !self.user_queue.lock().unwrap().is_empty()
                    || !self.system_queue.lock().unwrap().is_empty()
                    || !self.restart_queue.lock().unwrap().is_empty()
                    || !self.add_queue.lock().unwrap().is_empty()
                {
                    break;
                }
                tokio::time::sleep(PUMP_POLL).await;
            }
            self.resume_flag.store(false, Ordering::SeqCst);
            state.lock().unwrap().settlement_signaled = false;
            return Ok(());
        }

        // Advance after every settled cycle. Consensus closes the round
        // until external input; otherwise the next round opens at once so
        // pass-heavy idle states don't strand the room on a stale number.
        let (next_round, reopened) = {
            let mut s = state.lock().unwrap();
            s.round_number += 1;
            s.settlement_signaled = false;
            s.round_has_activity = false;
            s.round_open = !all_passed;
            (s.round_number, !all_passed)
        };
        if reopened {
            out.send(ChatEvent::RoundStarted {
                round_number: next_round,
                agents: self.agent_names(),
            })
            .map_err(|_| RoomError::SubscriberGone)?;
        }
        Ok(())
    }

    /// Signal settlement when a round has seen activity, all agents are
    /// idle, and every inbox is drained. Called by agent loops as they go
    /// idle and by inbox-poll timeouts.
    pub(crate) fn try_signal_settlement(
        &self,
        state: &Mutex<PersistentState>,
        event_tx: &EventTx,
    ) {
        let mut s = state.lock().unwrap();
        if s.settlement_signaled || !s.round_has_activity {
            return;
        }
        if !s.agent_idle.values().all(|idle| *idle) {
            return;
        }
        {
            let inboxes = self.inboxes.lock().unwrap();
            if inboxes.values().any(|i| i.depth.load(Ordering::SeqCst) > 0) {
                return;
            }
        }
        s.settlement_signaled = true;
        let _ = event_tx.send(None);
    }

    fn finish_persistent(&self, tasks: HashMap<String, JoinHandle<()>>) {
        for task in tasks.into_values() {
            task.abort();
        }
        self.clear_runtime_state();
    }

    /// Record a finished (non-stopped) response: history, pass state, and
    /// share relays to peers.
    pub(crate) fn process_persistent_response(
        &self,
        agent_name: &str,
        response: &AgentResponse,
        message_round: u64,
        state: &Mutex<PersistentState>,
        event_tx: &EventTx,
    ) {
        if detect_pass(&response.response) {
            {
                let mut s = state.lock().unwrap();
                s.agent_passed.insert(agent_name.to_string(), true);
                s.agent_idle.insert(agent_name.to_string(), true);
            }
            self.history.lock().unwrap().push(HistoryMessage::in_round(
                agent_name,
                "[PASS]",
                message_round,
            ));
            self.try_signal_settlement(state, event_tx);
            return;
        }

        let shareable = extract_shareable(&response.response);
        {
            let mut s = state.lock().unwrap();
            s.agent_passed.insert(agent_name.to_string(), false);
            s.agent_idle.insert(agent_name.to_string(), true);
        }
        self.history.lock().unwrap().push(HistoryMessage::in_round(
            agent_name,
            shareable.clone(),
            message_round,
        ));

        if shareable != PRIVATE_PLACEHOLDER {
            let peers: Vec<String> = self
                .agent_names()
                .into_iter()
                .filter(|other| other != agent_name)
                .collect();
            let mut targets = Vec::new();
            for other in peers {
                if self.should_relay_share(agent_name, &other, &shareable) {
                    state.lock().unwrap().agent_idle.insert(other.clone(), false);
                    targets.push(other);
                }
            }
            self.enqueue_delivery(agent_name, &shareable, Some(message_round), &targets);
        }

        self.try_signal_settlement(state, event_tx);
    }
}

fn spawn_agent_loop(
    room: Arc<ChatRoom>,
    agent: Arc<dyn Participant>,
    rx: mpsc::UnboundedReceiver<InboxItem>,
    depth: Arc<AtomicUsize>,
    state: Arc<Mutex<PersistentState>>,
    event_tx: EventTx,
) -> JoinHandle<()> {
    tokio::spawn(agent_loop(room, agent, rx, depth, state, event_tx))
}

/// One agent's loop: wait for inbox → batch → prompt → stream → relay.
async fn agent_loop(
    room: Arc<ChatRoom>,
    agent: Arc<dyn Participant>,
    mut rx: mpsc::UnboundedReceiver<InboxItem>,
    depth: Arc<AtomicUsize>,
    state: Arc<Mutex<PersistentState>>,
    event_tx: EventTx,
) {
    let name = agent.name().to_string();
    loop {
        let first = tokio::select! {
            _ = room.cancel.cancelled() => return,
            item = tokio::time::timeout(INBOX_POLL, rx.recv()) => match item {
                Err(_) => {
                    room.try_signal_settlement(&state, &event_tx);
                    if state.lock().unwrap().settlement_signaled {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    continue;
                }
                // Inbox sender dropped: the agent was removed.
                Ok(None) => return,
                Ok(Some(item)) => item,
            },
        };
        depth.fetch_sub(1, Ordering::SeqCst);

        {
            let mut s = state.lock().unwrap();
            s.agent_idle.insert(name.clone(), false);
            s.agent_passed.insert(name.clone(), false);
        }

        // Drain whatever else is buffered so one turn handles the batch.
        let mut batch = vec![first];
        while let Ok(item) = rx.try_recv() {
            depth.fetch_sub(1, Ordering::SeqCst);
            batch.push(item);
        }
        for item in &batch {
            room.ack_delivery(&event_tx, item, &name);
        }
        let message_round = batch
            .iter()
            .filter_map(|item| item.round)
            .max()
            .unwrap_or_else(|| state.lock().unwrap().round_number);

        let is_first_message = {
            let mut s = state.lock().unwrap();
            let first = !s.agent_initialized.get(&name).copied().unwrap_or(false);
            s.agent_initialized.insert(name.clone(), true);
            first
        };
        let prompt = room.format_persistent_events_prompt(&name, &batch, is_first_message);

        let mut sections = HashMap::new();
        sections.insert("message".to_string(), prompt.clone());
        let _ = event_tx.send(Some(ChatEvent::AgentPromptAssembled {
            agent_name: name.clone(),
            round_number: message_round,
            sections,
        }));

        // Stream the turn, racing the stop signal and a hard deadline.
        let stop = room.stop_token(&name);
        let hard_wait = room
            .timeout
            .min(agent.parse_timeout().max(Duration::from_secs(1)))
            + Duration::from_secs(1);
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<AgentChunk>();
        let stream_agent = agent.clone();
        let stream_prompt = prompt.clone();
        let stream_timeout = room.timeout;
        let stream_task = tokio::spawn(async move {
            stream_agent
                .stream(&stream_prompt, stream_timeout, chunk_tx)
                .await;
        });

        let deadline = tokio::time::Instant::now() + hard_wait;
        let mut partial = String::new();
        let mut response: Option<AgentResponse> = None;
        let mut was_stopped = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        if handle_chunk(
                            chunk, &name, message_round, &mut partial,
                            &mut response, &event_tx,
                        ) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = stop.cancelled() => { was_stopped = true; break; }
                _ = tokio::time::sleep_until(deadline) => { timed_out = true; break; }
            }
        }

        if timed_out {
            warn!(agent = %name, wait_secs = hard_wait.as_secs_f64(), "persistent wait timed out; forcing cancel");
            agent.cancel_turn().await;
            stream_task.abort();
            let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                agent_name: name.clone(),
                round_number: message_round,
                response: failed_response(&name, "Timeout"),
                passed: false,
                stopped: true,
            }));
            room.any_stopped.store(true, Ordering::SeqCst);
            room.reset_stop_token(&name);
            {
                let mut s = state.lock().unwrap();
                s.agent_passed.insert(name.clone(), false);
                s.agent_idle.insert(name.clone(), true);
            }
            room.try_signal_settlement(&state, &event_tx);
            continue;
        }

        if was_stopped {
            agent.cancel_turn().await;
            stream_task.abort();
            // A response may have raced in just as the stop fired.
            while let Ok(chunk) = chunk_rx.try_recv() {
                handle_chunk(chunk, &name, message_round, &mut partial, &mut response, &event_tx);
            }
            if response.is_none() {
                let partial_text = if partial.trim().is_empty() {
                    "(stopped)".to_string()
                } else {
                    partial.trim().to_string()
                };
                let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                    agent_name: name.clone(),
                    round_number: message_round,
                    response: failed_response(&name, partial_text),
                    passed: false,
                    stopped: true,
                }));
                room.any_stopped.store(true, Ordering::SeqCst);
                room.reset_stop_token(&name);
                {
                    let mut s = state.lock().unwrap();
                    s.agent_passed.insert(name.clone(), false);
                    s.agent_idle.insert(name.clone(), true);
                }
                room.try_signal_settlement(&state, &event_tx);
                continue;
            }
        }

        if response.is_none() {
            // Stream ended without a terminal chunk. A panic surfaces as a
            // failed completion; anything else leaves the state untouched.
            match stream_task.await {
                Err(join_err) if join_err.is_panic() => {
                    let resp = failed_response(&name, "agent stream panicked");
                    let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                        agent_name: name.clone(),
                        round_number: message_round,
                        response: resp.clone(),
                        passed: false,
                        stopped: false,
                    }));
                    response = Some(resp);
                }
                _ => {
                    debug!(agent = %name, "stream ended without a response");
                    continue;
                }
            }
        }

        if let Some(response) = response {
            room.process_persistent_response(&name, &response, message_round, &state, &event_tx);
        }
    }
}

/// Forward one chunk to the event queue. Returns true when the terminal
/// response arrived.
fn handle_chunk(
    chunk: AgentChunk,
    name: &str,
    message_round: u64,
    partial: &mut String,
    response: &mut Option<AgentResponse>,
    event_tx: &EventTx,
) -> bool {
    match chunk {
        AgentChunk::Text(text) => {
            partial.push_str(&text);
            let _ = event_tx.send(Some(ChatEvent::AgentStreamChunk {
                agent_name: name.to_string(),
                round_number: message_round,
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
                round_number: message_round,
                request_id: request.request_id,
                tool_name: request.tool_name,
                tool_input: request.tool_input,
                description: request.description,
            }));
            false
        }
        AgentChunk::Response(resp) => {
            if let Some(stderr) = &resp.stderr {
                let _ = event_tx.send(Some(ChatEvent::AgentStderr {
                    agent_name: name.to_string(),
                    round_number: message_round,
                    text: stderr.clone(),
                }));
            }
            let _ = event_tx.send(Some(ChatEvent::AgentCompleted {
                agent_name: name.to_string(),
                round_number: message_round,
                response: resp.clone(),
                passed: detect_pass(&resp.response),
                stopped: false,
            }));
            *response = Some(resp);
            true
        }
    }
}
