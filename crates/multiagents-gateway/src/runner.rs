//! Session runner: wires rooms to the store and WebSocket subscribers.
//!
//! Owns the per-session run task, the pre-warmed agent pools, subscriber
//! ack cursors, and the card engine integration. All store calls run on the
//! blocking pool so the event pump never stalls on SQLite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use multiagents_agent::{create_agents, ChatAgent, AgentChunk, Participant, PermissionResponse};
use multiagents_cards::{Card, CardEngine, CardPhaseEntry, CardStatus, CoordinationStage};
use multiagents_core::{AgentPersona, PermissionMode};
use multiagents_room::prompts::{format_cards_section, format_session_context, ParticipantInfo};
use multiagents_room::{ChatEvent, ChatRoom, RoomOptions};
use multiagents_sessions::{SessionStore, SettingsStore, StoreError};

use crate::wire::event_to_json;

const WARMUP_TURN_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_REPLAY_LIMIT: usize = 500;

/// Immutable runner-level defaults (CLI flags override the settings layer).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub timeout: Duration,
    pub send_timeout: Duration,
    pub parse_timeout: Duration,
    pub hard_timeout: Option<Duration>,
    pub warmup_ttl: Duration,
    pub ack_ttl: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            send_timeout: Duration::from_secs(120),
            parse_timeout: Duration::from_secs(1200),
            hard_timeout: None,
            warmup_ttl: Duration::from_secs(300),
            ack_ttl: Duration::from_secs(300),
        }
    }
}

/// One subscriber connection: outbound channel plus ack cursor.
struct Subscriber {
    tx: mpsc::Sender<String>,
    acked: u64,
    acked_at: Instant,
}

/// Per-round counters, logged as a `round_summary` event when the round ends.
struct RoundMetrics {
    round_number: u64,
    started_at: Instant,
    stream_chunks: HashMap<String, u64>,
    latencies_ms: HashMap<String, f64>,
    send_failures: u64,
}

impl RoundMetrics {
    fn new(round_number: u64, agents: &[String]) -> Self {
        Self {
            round_number,
            started_at: Instant::now(),
            stream_chunks: agents.iter().map(|name| (name.clone(), 0)).collect(),
            latencies_ms: HashMap::new(),
            send_failures: 0,
        }
    }
}

struct PendingRun {
    prompt: String,
    personas: Vec<AgentPersona>,
    start_round: u64,
}

pub struct SessionRunner {
    store: Arc<SessionStore>,
    settings: Arc<SettingsStore>,
    config: RunnerConfig,
    subscribers: DashMap<String, HashMap<u64, Subscriber>>,
    conn_seq: AtomicU64,
    tasks: DashMap<String, JoinHandle<()>>,
    rooms: DashMap<String, Arc<ChatRoom>>,
    pending_runs: DashMap<String, PendingRun>,
    session_send_timeouts: DashMap<String, Duration>,
    round_metrics: DashMap<String, RoundMetrics>,
    /// Pre-warmed agents: session_id -> agent_name -> agent.
    agent_pools: DashMap<String, HashMap<String, Arc<ChatAgent>>>,
    warmup_tasks: DashMap<String, JoinHandle<()>>,
    idle_cleanup_tasks: DashMap<String, JoinHandle<()>>,
    card_engines: Arc<DashMap<String, Arc<Mutex<CardEngine>>>>,
    active_card_tasks: DashMap<String, String>,
    card_phase_tasks: DashMap<String, JoinHandle<()>>,
    card_phase_tokens: DashMap<String, u64>,
    delegation_cards: DashMap<String, String>,
    delegation_responses: DashMap<String, HashMap<String, String>>,
}

impl SessionRunner {
    pub fn new(store: Arc<SessionStore>, settings: Arc<SettingsStore>, config: RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            config,
            subscribers: DashMap::new(),
            conn_seq: AtomicU64::new(0),
            tasks: DashMap::new(),
            rooms: DashMap::new(),
            pending_runs: DashMap::new(),
            session_send_timeouts: DashMap::new(),
            round_metrics: DashMap::new(),
            agent_pools: DashMap::new(),
            warmup_tasks: DashMap::new(),
            idle_cleanup_tasks: DashMap::new(),
            card_engines: Arc::new(DashMap::new()),
            active_card_tasks: DashMap::new(),
            card_phase_tasks: DashMap::new(),
            card_phase_tokens: DashMap::new(),
            delegation_cards: DashMap::new(),
            delegation_responses: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    async fn store_call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&SessionStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    // -- Subscribers ----------------------------------------------------------

    /// Register a WS connection; returns its id for later unsubscribe/ack.
    pub fn subscribe(&self, session_id: &str, tx: mpsc::Sender<String>) -> u64 {
        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(
                conn_id,
                Subscriber {
                    tx,
                    acked: 0,
                    acked_at: Instant::now(),
                },
            );
        self.cancel_idle_cleanup(session_id);
        conn_id
    }

    pub fn unsubscribe(self: &Arc<Self>, session_id: &str, conn_id: u64) {
        let mut empty = false;
        if let Some(mut subs) = self.subscribers.get_mut(session_id) {
            subs.remove(&conn_id);
            empty = subs.is_empty();
        }
        if empty {
            self.subscribers.remove(session_id);
            if !self.is_running(session_id) {
                self.schedule_idle_cleanup(session_id);
            }
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        if let Some(task) = self.tasks.get(session_id) {
            if !task.is_finished() {
                return true;
            }
        }
        if self.pending_runs.contains_key(session_id) {
            return true;
        }
        matches!(self.card_phase_tasks.get(session_id), Some(task) if !task.is_finished())
    }

    fn prune_stale_acks(&self, session_id: &str) {
        if self.config.ack_ttl.is_zero() {
            return;
        }
        if let Some(mut subs) = self.subscribers.get_mut(session_id) {
            let now = Instant::now();
            subs.retain(|_, sub| now.duration_since(sub.acked_at) <= self.config.ack_ttl);
        }
    }

    /// Persist an event (assigning its id) and fan it out to subscribers.
    /// Returns how many subscribers received it.
    pub async fn broadcast(&self, session_id: &str, mut data: Value) -> usize {
        if data.get("event_id").is_none() {
            let sid = session_id.to_string();
            match self.store_call(move |s| s.reserve_event_id(&sid)).await {
                Ok(event_id) => {
                    data["event_id"] = json!(event_id);
                    let sid = session_id.to_string();
                    let payload = data.clone();
                    if let Err(e) = self
                        .store_call(move |s| s.save_event(&sid, event_id, &payload))
                        .await
                    {
                        warn!(session_id, event_id, error = %e, "failed to persist event");
                    }
                }
                Err(e) => {
                    warn!(session_id, error = %e, "failed to assign event id");
                }
            }
        }

        self.prune_stale_acks(session_id);
        let snapshot: Vec<(u64, mpsc::Sender<String>)> = match self.subscribers.get(session_id) {
            Some(subs) => subs.iter().map(|(id, sub)| (*id, sub.tx.clone())).collect(),
            None => {
                debug!(session_id, "broadcast dropped (no subscribers)");
                return 0;
            }
        };
        let timeout = self
            .session_send_timeouts
            .get(session_id)
            .map(|t| *t)
            .unwrap_or(self.config.send_timeout);
        let payload = data.to_string();

        let mut sent = 0;
        let mut dead = Vec::new();
        for (conn_id, tx) in snapshot {
            match tokio::time::timeout(timeout, tx.send(payload.clone())).await {
                Ok(Ok(())) => sent += 1,
                _ => {
                    warn!(
                        session_id,
                        conn_id,
                        event_type = data.get("type").and_then(|v| v.as_str()).unwrap_or(""),
                        "broadcast failed; dropping subscriber"
                    );
                    if let Some(mut metrics) = self.round_metrics.get_mut(session_id) {
                        metrics.send_failures += 1;
                    }
                    dead.push(conn_id);
                }
            }
        }
        if !dead.is_empty() {
            if let Some(mut subs) = self.subscribers.get_mut(session_id) {
                for conn_id in dead {
                    subs.remove(&conn_id);
                }
            }
        }
        sent
    }

    /// Replay durable events after `after_event_id` to one subscriber.
    pub async fn replay_events(&self, session_id: &str, after_event_id: u64, tx: &mpsc::Sender<String>) {
        let sid = session_id.to_string();
        let events = self
            .store_call(move |s| s.get_events_since(&sid, after_event_id, EVENT_REPLAY_LIMIT))
            .await
            .unwrap_or_default();
        for event in events {
            if tx.send(event.to_string()).await.is_err() {
                break;
            }
        }
    }

    /// Record a subscriber ack and prune events everyone has seen.
    pub async fn ack(&self, session_id: &str, conn_id: u64, event_id: u64) {
        let min_ack = {
            let Some(mut subs) = self.subscribers.get_mut(session_id) else {
                return;
            };
            if let Some(sub) = subs.get_mut(&conn_id) {
                sub.acked = sub.acked.max(event_id);
                sub.acked_at = Instant::now();
            }
            subs.values().map(|s| s.acked).min().unwrap_or(0)
        };
        self.prune_stale_acks(session_id);
        if min_ack > 0 {
            let sid = session_id.to_string();
            if let Err(e) = self.store_call(move |s| s.prune_events(&sid, min_ack)).await {
                warn!(session_id, error = %e, "failed to prune events");
            }
        }
    }

    // -- Run control ----------------------------------------------------------

    pub fn run_prompt(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        personas: Vec<AgentPersona>,
        start_round: u64,
    ) {
        self.cancel_idle_cleanup(session_id);
        if self.is_running(session_id) {
            if self.pending_runs.contains_key(session_id) {
                info!(session_id, "session already running; replacing pending run");
            }
            self.pending_runs.insert(
                session_id.to_string(),
                PendingRun {
                    prompt: prompt.to_string(),
                    personas,
                    start_round,
                },
            );
            return;
        }
        let runner = self.clone();
        let key = session_id.to_string();
        let session_id = session_id.to_string();
        let prompt = prompt.to_string();
        let task = tokio::spawn(async move {
            runner.execute(session_id, prompt, personas, start_round).await;
        });
        self.tasks.insert(key, task);
    }

    pub fn inject_message(&self, session_id: &str, text: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.inject_user_message(text);
        }
    }

    pub fn stop_agent(&self, session_id: &str, agent_name: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.stop_agent(agent_name);
        }
    }

    pub fn stop_round(&self, session_id: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.stop_round(true);
        }
    }

    pub fn resume(&self, session_id: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.resume();
        }
    }

    /// DM an agent (coalesced with other DMs inside the debounce window).
    pub fn restart_agent(&self, session_id: &str, agent_name: &str, dm_text: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.restart_agent(agent_name, dm_text);
        }
    }

    pub fn respond_to_permission(&self, session_id: &str, agent_name: &str, response: PermissionResponse) {
        if let Some(room) = self.rooms.get(session_id) {
            room.respond_to_permission(agent_name, response);
        }
    }

    /// Route a permission decision to one agent, or to every agent when the
    /// client doesn't know which one asked.
    pub fn resolve_permission(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        agent_name: Option<&str>,
    ) {
        let Some(room) = self.rooms.get(session_id) else {
            return;
        };
        let response = PermissionResponse {
            request_id: request_id.to_string(),
            approved,
        };
        match agent_name {
            Some(name) => room.respond_to_permission(name, response),
            None => {
                for name in room.agent_names() {
                    room.respond_to_permission(&name, response.clone());
                }
            }
        }
    }

    pub async fn cancel(&self, session_id: &str) {
        if let Some((_, task)) = self.tasks.remove(session_id) {
            if let Some(room) = self.rooms.get(session_id) {
                room.stop_round(false);
                room.cancel();
            }
            let _ = task.await;
        }
        self.pending_runs.remove(session_id);
        self.cancel_next_card_phase(session_id);
    }

    // -- Warmup pool ----------------------------------------------------------

    /// Pre-warm agents with a trivial [PASS] turn so the first real message
    /// skips cold-start cost. Session ids land in the store for resume.
    pub async fn warmup_agents(self: &Arc<Self>, session_id: &str, personas: Vec<AgentPersona>) {
        let sid = session_id.to_string();
        let stored_ids = self
            .store_call(move |s| s.get_agent_session_ids(&sid))
            .await
            .unwrap_or_default();
        let sid = session_id.to_string();
        let session = self.store_call(move |s| s.get_session(&sid)).await.ok().flatten();
        let working_dir = session.map(|s| s.working_dir).unwrap_or_default();

        let agents = match create_agents(&personas, Some(self.config.parse_timeout), self.config.hard_timeout) {
            Ok(agents) => agents,
            Err(e) => {
                warn!(session_id, error = %e, "warmup agent creation failed");
                return;
            }
        };
        let participants: Vec<ParticipantInfo> = personas
            .iter()
            .map(|p| ParticipantInfo {
                name: p.name.clone(),
                kind: p.kind.as_str().to_string(),
            })
            .collect();

        let mut warmed: HashMap<String, Arc<ChatAgent>> = HashMap::new();
        let mut handles = Vec::new();
        for agent in agents {
            let name = agent.name().to_string();
            if let Some(Some(cli_sid)) = stored_ids.get(&name) {
                agent.set_session_id(Some(cli_sid.clone())).await;
            }
            if !working_dir.is_empty() {
                let dir = working_dir.clone();
                agent.update_settings(|s| s.project_dir = Some(dir));
            }
            let role = personas
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.role.clone())
                .unwrap_or_default();
            let context = format_session_context(&name, Some(&participants), &role);
            let warmup_prompt = format!("{context}\n\nPlease respond with exactly [PASS].");

            let runner = self.clone();
            let session_id = session_id.to_string();
            let agent_clone = agent.clone();
            handles.push(tokio::spawn(async move {
                let (tx, mut rx) = mpsc::unbounded_channel::<AgentChunk>();
                let started = Instant::now();
                let mut latency = None;
                {
                    let stream = agent_clone.stream(&warmup_prompt, WARMUP_TURN_TIMEOUT, tx);
                    tokio::pin!(stream);
                    loop {
                        tokio::select! {
                            _ = &mut stream => {
                                while let Ok(chunk) = rx.try_recv() {
                                    if let AgentChunk::Response(r) = chunk {
                                        latency = Some(r.latency_ms);
                                    }
                                }
                                break;
                            }
                            chunk = rx.recv() => match chunk {
                                Some(AgentChunk::Response(r)) => { latency = Some(r.latency_ms); }
                                Some(_) => {}
                                None => break,
                            }
                        }
                    }
                }
                match latency {
                    Some(ms) => info!(agent = %agent_clone.name(), latency_ms = ms, "warmed up"),
                    None => warn!(
                        agent = %agent_clone.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "warmup produced no response; agent will retry on first real message"
                    ),
                }
                if let Some(cli_sid) = agent_clone.session_id() {
                    let name = agent_clone.name().to_string();
                    let _ = runner
                        .store_call(move |s| s.save_agent_session_id(&session_id, &name, &cli_sid))
                        .await;
                }
                agent_clone
            }));
        }
        for handle in handles {
            if let Ok(agent) = handle.await {
                warmed.insert(agent.name().to_string(), agent);
            }
        }
        info!(session_id, ready = warmed.len(), "session warmup complete");
        self.agent_pools.insert(session_id.to_string(), warmed);
        self.warmup_tasks.remove(session_id);
    }

    /// Kick off warmup in the background unless it is pointless right now.
    pub fn start_warmup(self: &Arc<Self>, session_id: &str, personas: Vec<AgentPersona>) {
        if self.warmup_tasks.contains_key(session_id)
            || self.agent_pools.contains_key(session_id)
            || self.is_running(session_id)
        {
            return;
        }
        self.cancel_idle_cleanup(session_id);
        let runner = self.clone();
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            runner.warmup_agents(&sid, personas).await;
        });
        self.warmup_tasks.insert(session_id.to_string(), task);
    }

    /// Pre-warmed agents when available, fresh ones (with restored CLI
    /// session ids) otherwise.
    async fn get_warmed_agents(
        &self,
        session_id: &str,
        personas: &[AgentPersona],
    ) -> Vec<Arc<ChatAgent>> {
        let pool = self
            .agent_pools
            .get(session_id)
            .map(|p| p.clone())
            .unwrap_or_default();
        let mut agents = Vec::new();
        let mut missing = Vec::new();
        for persona in personas {
            match pool.get(&persona.name) {
                Some(agent) => {
                    let parse = self.config.parse_timeout;
                    let hard = self.config.hard_timeout;
                    agent.update_settings(|s| {
                        s.parse_timeout = parse;
                        s.hard_timeout = hard;
                    });
                    agents.push(agent.clone());
                }
                None => missing.push(persona.clone()),
            }
        }
        if !missing.is_empty() {
            let sid = session_id.to_string();
            let stored_ids = self
                .store_call(move |s| s.get_agent_session_ids(&sid))
                .await
                .unwrap_or_default();
            if let Ok(fresh) =
                create_agents(&missing, Some(self.config.parse_timeout), self.config.hard_timeout)
            {
                for agent in fresh {
                    if let Some(Some(cli_sid)) = stored_ids.get(agent.name()) {
                        agent.set_session_id(Some(cli_sid.clone())).await;
                    }
                    agents.push(agent);
                }
            }
        }
        agents
    }

    /// Add a persona to a running or idle session.
    pub async fn add_agent(&self, session_id: &str, persona: AgentPersona) {
        let Ok(agents) =
            create_agents(std::slice::from_ref(&persona), Some(self.config.parse_timeout), self.config.hard_timeout)
        else {
            return;
        };
        let Some(agent) = agents.into_iter().next() else {
            return;
        };
        let sid = session_id.to_string();
        let working_dir = self
            .store_call(move |s| s.get_session(&sid))
            .await
            .ok()
            .flatten()
            .map(|s| s.working_dir)
            .unwrap_or_default();
        if !working_dir.is_empty() {
            agent.update_settings(|s| s.project_dir = Some(working_dir));
        }
        self.agent_pools
            .entry(session_id.to_string())
            .or_default()
            .insert(agent.name().to_string(), agent.clone());
        if let Some(room) = self.rooms.get(session_id) {
            room.add_agent(agent as Arc<dyn Participant>);
        }
    }

    /// Remove an agent from a running or idle session.
    pub async fn remove_agent(&self, session_id: &str, name: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.remove_agent(name);
        }
        let removed = self
            .agent_pools
            .get_mut(session_id)
            .and_then(|mut pool| pool.remove(name));
        if let Some(agent) = removed {
            tokio::spawn(async move { agent.shutdown().await });
        }
    }

    fn cancel_idle_cleanup(&self, session_id: &str) {
        if let Some((_, task)) = self.idle_cleanup_tasks.remove(session_id) {
            task.abort();
        }
    }

    fn schedule_idle_cleanup(self: &Arc<Self>, session_id: &str) {
        if self.config.warmup_ttl.is_zero() || self.idle_cleanup_tasks.contains_key(session_id) {
            return;
        }
        let runner = self.clone();
        let sid = session_id.to_string();
        let ttl = self.config.warmup_ttl;
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if runner.is_running(&sid) || runner.subscribers.contains_key(&sid) {
                runner.idle_cleanup_tasks.remove(&sid);
                return;
            }
            runner.cleanup_session(&sid, true);
            runner.idle_cleanup_tasks.remove(&sid);
        });
        self.idle_cleanup_tasks.insert(session_id.to_string(), task);
    }

    /// Tear down warmed agents (and optionally the next card phase).
    pub fn cleanup_session(&self, session_id: &str, cancel_card_phase_tasks: bool) {
        self.cancel_idle_cleanup(session_id);
        self.session_send_timeouts.remove(session_id);
        if cancel_card_phase_tasks {
            self.cancel_next_card_phase(session_id);
        }
        if let Some((_, task)) = self.warmup_tasks.remove(session_id) {
            task.abort();
        }
        if let Some((_, pool)) = self.agent_pools.remove(session_id) {
            for agent in pool.into_values() {
                tokio::spawn(async move { agent.shutdown().await });
            }
        }
    }

    /// Full teardown: cancel tasks, clean agents, delete from the store.
    pub async fn delete_session(&self, session_id: &str) {
        if let Some((_, task)) = self.tasks.remove(session_id) {
            if let Some(room) = self.rooms.get(session_id) {
                room.cancel();
            }
            let _ = task.await;
        }
        self.pending_runs.remove(session_id);
        self.cancel_next_card_phase(session_id);
        self.cleanup_session(session_id, true);

        self.card_engines.remove(session_id);
        self.active_card_tasks.remove(session_id);
        self.delegation_cards.remove(session_id);
        self.delegation_responses.remove(session_id);
        self.subscribers.remove(session_id);
        self.rooms.remove(session_id);
        self.round_metrics.remove(session_id);

        let sid = session_id.to_string();
        if let Err(e) = self.store_call(move |s| s.delete_session(&sid)).await {
            warn!(session_id, error = %e, "failed to delete session");
        }
    }

    // -- Cards ----------------------------------------------------------------

    /// Lazy-create the engine for a session, loading persisted cards.
    pub async fn card_engine(
        &self,
        session_id: &str,
        personas: &[AgentPersona],
    ) -> Arc<Mutex<CardEngine>> {
        if let Some(engine) = self.card_engines.get(session_id) {
            return engine.clone();
        }
        let mut engine = CardEngine::new(personas.iter().map(|p| p.name.clone()).collect());
        let sid = session_id.to_string();
        if let Ok(saved) = self.store_call(move |s| s.get_cards(&sid)).await {
            let cards: Vec<Card> = saved.iter().filter_map(wire_to_card).collect();
            engine.load_cards(cards);
        }
        let engine = Arc::new(Mutex::new(engine));
        self.card_engines
            .insert(session_id.to_string(), engine.clone());
        engine
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_card(
        &self,
        session_id: &str,
        personas: &[AgentPersona],
        title: &str,
        description: &str,
        planner: &str,
        implementer: &str,
        reviewer: &str,
        coordinator: &str,
    ) -> Card {
        let engine = self.card_engine(session_id, personas).await;
        let card = engine.lock().unwrap().create_card(
            title,
            description,
            planner,
            implementer,
            reviewer,
            coordinator,
        );
        self.persist_card(session_id, &card).await;
        card
    }

    pub async fn update_card(
        &self,
        session_id: &str,
        card_id: &str,
        fields: &HashMap<String, Value>,
    ) -> Result<Card, multiagents_cards::CardError> {
        let Some(engine) = self.card_engines.get(session_id) else {
            return Err(multiagents_cards::CardError::NotFound {
                id: card_id.to_string(),
            });
        };
        let card = engine.lock().unwrap().update_card(card_id, fields)?;
        self.persist_card(session_id, &card).await;
        Ok(card)
    }

    pub async fn mark_card_done(
        &self,
        session_id: &str,
        card_id: &str,
    ) -> Result<Card, multiagents_cards::CardError> {
        let Some(engine) = self.card_engines.get(session_id) else {
            return Err(multiagents_cards::CardError::NotFound {
                id: card_id.to_string(),
            });
        };
        let card = engine.lock().unwrap().mark_done(card_id)?;
        self.persist_card(session_id, &card).await;
        Ok(card)
    }

    pub async fn delete_card(
        &self,
        session_id: &str,
        card_id: &str,
    ) -> Result<(), multiagents_cards::CardError> {
        let Some(engine) = self.card_engines.get(session_id) else {
        return Err(multiagents_cards::CardError::NotFound {
                id: card_id.to_string(),
            });
        };
        engine.lock().unwrap().delete_card(card_id)?;
        let sid = session_id.to_string();
        let cid = card_id.to_string();
        let _ = self.store_call(move |s| s.delete_card(&sid, &cid)).await;
        Ok(())
    }

    pub async fn get_cards(&self, session_id: &str, personas: &[AgentPersona]) -> Vec<Value> {
        let engine = self.card_engine(session_id, personas).await;
        let cards = engine.lock().unwrap().get_cards();
        cards.iter().map(|c| c.to_wire()).collect()
    }

    /// backlog -> planning/coordinating, then a single-agent round.
    pub async fn start_card(
        self: &Arc<Self>,
        session_id: &str,
        card_id: &str,
        personas: &[AgentPersona],
    ) -> Result<(), multiagents_cards::CardError> {
        let engine = self.card_engine(session_id, personas).await;
        let (card, prompt) = engine.lock().unwrap().start_card(card_id)?;
        self.persist_card(session_id, &card).await;
        self.broadcast(session_id, json!({"type": "card_updated", "card": card.to_wire()}))
            .await;
        let Some(agent_name) = resolve_card_agent(&card) else {
            warn!(card_id, status = %card.status, "card has no agent for phase, cannot start");
            return Ok(());
        };
        self.run_card_phase(session_id, card_id, &prompt, &agent_name)
            .await;
        Ok(())
    }

    /// Run a SINGLE-AGENT round for a card phase.
    pub async fn run_card_phase(
        self: &Arc<Self>,
        session_id: &str,
        card_id: &str,
        prompt: &str,
        agent_name: &str,
    ) {
        self.active_card_tasks
            .insert(session_id.to_string(), card_id.to_string());
        let card_wire = self
            .card_engines
            .get(session_id)
            .and_then(|engine| engine.lock().unwrap().get_card(card_id).ok())
            .map(|c| c.to_wire());
        if let Some(card) = card_wire {
            self.broadcast(
                session_id,
                json!({
                    "type": "card_phase_started",
                    "card": card,
                    "agent": agent_name,
                    "prompt": prompt,
                }),
            )
            .await;
        }
        let persona = self
            .persona_for(session_id, agent_name)
            .await
            .unwrap_or_else(|| AgentPersona {
                name: agent_name.to_string(),
                kind: agent_name.parse().unwrap_or(multiagents_core::AgentKind::Claude),
                role: String::new(),
                model: None,
            });
        self.run_prompt(session_id, prompt, vec![persona], 0);
    }

    async fn persona_for(&self, session_id: &str, agent_name: &str) -> Option<AgentPersona> {
        let sid = session_id.to_string();
        let session = self.store_call(move |s| s.get_session(&sid)).await.ok().flatten()?;
        session
            .agents
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(agent_name))
    }

    /// Delegation: all agents discuss roles (or just the coordinator when
    /// one is already assigned).
    pub async fn delegate_card(
        self: &Arc<Self>,
        session_id: &str,
        card_id: &str,
        personas: &[AgentPersona],
    ) -> Result<(), multiagents_cards::CardError> {
        let engine = self.card_engine(session_id, personas).await;
        let (prompt, coordinator) = {
            let engine = engine.lock().unwrap();
            let card = engine.get_card(card_id)?;
            (engine.build_delegation_prompt(card_id)?, card.coordinator)
        };
        self.delegation_cards
            .insert(session_id.to_string(), card_id.to_string());
        self.delegation_responses
            .insert(session_id.to_string(), HashMap::new());
        if !coordinator.is_empty() {
            if let Some(persona) = self.persona_for(session_id, &coordinator).await {
                self.run_prompt(session_id, &prompt, vec![persona], 0);
                return Ok(());
            }
        }
        self.run_prompt(session_id, &prompt, personas.to_vec(), 0);
        Ok(())
    }

    fn cancel_next_card_phase(&self, session_id: &str) {
        if let Some((_, task)) = self.card_phase_tasks.remove(session_id) {
            task.abort();
        }
    }

    async fn persist_card(&self, session_id: &str, card: &Card) {
        let sid = session_id.to_string();
        let wire = card.to_wire();
        if let Err(e) = self.store_call(move |s| s.save_card(&sid, &wire)).await {
            warn!(session_id, card_id = %card.id, error = %e, "failed to persist card");
        }
    }

    // -- The run loop ----------------------------------------------------------

    async fn execute(
        self: Arc<Self>,
        session_id: String,
        prompt: String,
        personas: Vec<AgentPersona>,
        start_round: u64,
    ) {
        // Let an in-flight warmup finish so we reuse its agents.
        if let Some((_, task)) = self.warmup_tasks.remove(&session_id) {
            let _ = task.await;
        }

        let agents = self.get_warmed_agents(&session_id, &personas).await;

        let sid = session_id.clone();
        let session = self.store_call(move |s| s.get_session(&sid)).await.ok().flatten();
        let working_dir = session.as_ref().map(|s| s.working_dir.clone()).unwrap_or_default();
        let session_config = session.map(|s| s.config).unwrap_or_default();

        let config = self.effective_config(&session_config).await;
        let idle_timeout = config_duration(&config, "timeouts.idle").unwrap_or(self.config.timeout);
        if let Some(send) = config_duration(&config, "timeouts.send") {
            self.session_send_timeouts.insert(session_id.clone(), send);
        } else {
            self.session_send_timeouts.remove(&session_id);
        }

        // Per-agent settings: stored session ids, project dir, model and
        // permission settings, card CLI environment.
        let sid = session_id.clone();
        let stored_ids = self
            .store_call(move |s| s.get_agent_session_ids(&sid))
            .await
            .unwrap_or_default();
        let card_api_url =
            std::env::var("MULTIAGENTS_URL").unwrap_or_else(|_| "http://localhost:8421".into());
        let scripts_dir = scripts_dir();
        for agent in &agents {
            if agent.session_id().is_none() {
                if let Some(Some(cli_sid)) = stored_ids.get(agent.name()) {
                    agent.set_session_id(Some(cli_sid.clone())).await;
                }
            }
            let kind = agent.kind().as_str();
            let model = config
                .get(&format!("agents.{kind}.model"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let prompt_override = config
                .get(&format!("agents.{kind}.system_prompt"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let permission_mode = config
                .get(&format!("agents.{kind}.permissions"))
                .and_then(Value::as_str)
                .and_then(|m| m.parse::<PermissionMode>().ok())
                .unwrap_or_default();
            let permission_timeout = config_duration(&config, "permissions.timeout");
            let parse_timeout = config_duration(&config, "timeouts.parse");
            let hard_timeout = config_duration(&config, "timeouts.hard").filter(|d| !d.is_zero());
            let dir = (!working_dir.is_empty()).then(|| working_dir.clone());
            let env_path = format!(
                "{}:{}",
                scripts_dir,
                std::env::var("PATH").unwrap_or_default()
            );
            let session_env = session_id.clone();
            let url = card_api_url.clone();
            agent.update_settings(move |s| {
                if s.model.is_none() {
                    s.model = model;
                }
                if s.system_prompt_override.is_none() {
                    s.system_prompt_override = prompt_override;
                }
                s.permission_mode = permission_mode;
                if let Some(t) = permission_timeout {
                    s.permission_timeout = t;
                }
                if let Some(t) = parse_timeout {
                    s.parse_timeout = t;
                }
                if let Some(t) = hard_timeout {
                    s.hard_timeout = Some(t);
                }
                if dir.is_some() {
                    s.project_dir = dir;
                }
                s.extra_env.insert("MULTIAGENTS_SESSION".into(), session_env);
                s.extra_env.insert("MULTIAGENTS_URL".into(), url);
                s.extra_env.insert("PATH".into(), env_path);
            });
        }

        // Card context provider: the board changes mid-discussion, so it is
        // rebuilt per prompt.
        let engines = self.card_engines.clone();
        let context_session = session_id.clone();
        let context_provider = Box::new(move |agent_name: &str| {
            let Some(engine) = engines.get(&context_session) else {
                return Vec::new();
            };
            let cards = engine.lock().unwrap().get_cards();
            if cards.is_empty() {
                return Vec::new();
            }
            let name = agent_name.to_lowercase();
            let rows: Vec<(String, String, String, Vec<String>)> = cards
                .iter()
                .map(|c| {
                    let mut roles = Vec::new();
                    for (role, assignee) in [
                        ("coordinator", &c.coordinator),
                        ("planner", &c.planner),
                        ("implementer", &c.implementer),
                        ("reviewer", &c.reviewer),
                    ] {
                        if !assignee.is_empty() && *assignee == name {
                            roles.push(role.to_string());
                        }
                    }
                    (c.id.clone(), c.title.clone(), c.status.as_str().to_string(), roles)
                })
                .collect();
            let section = format_cards_section(&rows);
            if section.is_empty() {
                Vec::new()
            } else {
                vec![("cards".to_string(), section)]
            }
        });

        let participants: Vec<ParticipantInfo> = personas
            .iter()
            .map(|p| ParticipantInfo {
                name: p.name.clone(),
                kind: p.kind.as_str().to_string(),
            })
            .collect();
        let roles: HashMap<String, String> = personas
            .iter()
            .map(|p| (p.name.clone(), p.role.clone()))
            .collect();

        let room = ChatRoom::new(
            agents.iter().map(|a| a.clone() as Arc<dyn Participant>).collect(),
            RoomOptions {
                timeout: idle_timeout,
                participants: Some(participants),
                roles,
            },
            Some(context_provider),
        );

        let sid = session_id.clone();
        let existing = self.store_call(move |s| s.get_messages(&sid)).await.unwrap_or_default();
        // User messages are persisted by the WS handlers before run_prompt,
        // so a prompt that is already the latest stored message must not be
        // appended twice. Card-phase prompts are never stored and ride in as
        // the initial prompt instead.
        let already_recorded = existing
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content == prompt)
            .unwrap_or(false);
        let initial = (!prompt.is_empty() && !already_recorded).then(|| prompt.clone());
        // Reloaded history carries no round tags: the round counter restarts
        // with the run, so the whole stored transcript reads as current-round
        // context instead of splitting against stale round numbers.
        room.set_history(
            existing
                .into_iter()
                .map(|m| multiagents_core::HistoryMessage {
                    role: m.role,
                    content: m.content,
                    round: None,
                })
                .collect(),
        );

        self.rooms.insert(session_id.clone(), room.clone());
        let sid = session_id.clone();
        let _ = self.store_call(move |s| s.set_running(&sid, true)).await;

        let mode = config
            .get("room.mode")
            .and_then(Value::as_str)
            .unwrap_or("persistent")
            .to_string();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChatEvent>();
        let room_for_task = room.clone();
        let room_task = tokio::spawn(async move {
            let outcome = if mode == "rounds" {
                room_for_task.run(initial, start_round, events_tx).await
            } else {
                room_for_task.run_persistent(initial, start_round, events_tx).await
            };
            if let Err(e) = outcome {
                debug!(error = %e, "room run ended early");
            }
        });

        let mut round_number = start_round;
        while let Some(event) = events_rx.recv().await {
            match &event {
                ChatEvent::RoundStarted {
                    round_number: rn,
                    agents: round_agents,
                } => {
                    round_number = *rn;
                    self.round_metrics
                        .insert(session_id.clone(), RoundMetrics::new(*rn, round_agents));
                    let sid = session_id.clone();
                    let rn = *rn;
                    let _ = self.store_call(move |s| s.set_current_round(&sid, rn)).await;
                    let sid = session_id.clone();
                    let names = round_agents.clone();
                    let _ = self
                        .store_call(move |s| s.reset_agent_progress(&sid, &names, rn))
                        .await;
                }
                ChatEvent::AgentStreamChunk {
                    agent_name, text, ..
                } => {
                    if let Some(mut metrics) = self.round_metrics.get_mut(&session_id) {
                        *metrics.stream_chunks.entry(agent_name.clone()).or_insert(0) += 1;
                    }
                    let sid = session_id.clone();
                    let name = agent_name.clone();
                    let chunk = text.clone();
                    let rn = round_number;
                    let _ = self
                        .store_call(move |s| s.append_agent_stream(&sid, &name, rn, &chunk))
                        .await;
                }
                ChatEvent::AgentCompleted {
                    agent_name,
                    response,
                    passed,
                    ..
                } => {
                    if let Some(mut metrics) = self.round_metrics.get_mut(&session_id) {
                        metrics
                            .latencies_ms
                            .insert(agent_name.clone(), response.latency_ms);
                    }
                    // Store only what peers would see: the shareable extract
                    // (or the pass marker), never raw private reasoning.
                    let content = if *passed {
                        "[PASS]".to_string()
                    } else {
                        multiagents_room::extract_shareable(&response.response)
                    };
                    let sid = session_id.clone();
                    let name = agent_name.clone();
                    let rn = round_number;
                    let was_passed = *passed;
                    let _ = self
                        .store_call(move |s| {
                            s.save_message(&sid, &name, &content, Some(rn), was_passed)
                        })
                        .await;
                    if let Some(cli_sid) = &response.session_id {
                        let sid = session_id.clone();
                        let name = agent_name.clone();
                        let cli_sid = cli_sid.clone();
                        let _ = self
                            .store_call(move |s| s.save_agent_session_id(&sid, &name, &cli_sid))
                            .await;
                    }
                    let status = if response.success { "done" } else { "failed" };
                    let sid = session_id.clone();
                    let name = agent_name.clone();
                    let _ = self
                        .store_call(move |s| s.set_agent_status(&sid, &name, status, round_number))
                        .await;

                    if self.delegation_cards.contains_key(&session_id) {
                        self.delegation_responses
                            .entry(session_id.clone())
                            .or_default()
                            .insert(agent_name.clone(), response.response.clone());
                    }
                    self.advance_card_phase(&session_id, agent_name, &response.response)
                        .await;
                }
                ChatEvent::RoundPaused { .. } => {
                    let sid = session_id.clone();
                    let _ = self.store_call(move |s| s.set_paused(&sid, true)).await;
                }
                ChatEvent::RoundEnded { .. } => {
                    if let Some((_, metrics)) = self.round_metrics.remove(&session_id) {
                        let duration_ms =
                            metrics.started_at.elapsed().as_secs_f64() * 1000.0;
                        info!(
                            session_id = %session_id,
                            round = metrics.round_number,
                            duration_ms = %format!("{duration_ms:.2}"),
                            stream_chunks = %json!(metrics.stream_chunks),
                            agent_latency_ms = %json!(metrics.latencies_ms),
                            send_failures = metrics.send_failures,
                            "round_summary"
                        );
                    }
                    self.finish_delegation(&session_id).await;
                }
                _ => {}
            }
            self.broadcast(&session_id, event_to_json(&event)).await;
        }
        let _ = room_task.await;

        if room.is_cancelled() {
            info!(session_id = %session_id, "session cancelled");
            self.broadcast(
                &session_id,
                json!({"type": "discussion_ended", "reason": "cancelled"}),
            )
            .await;
        }

        // Teardown mirrors startup: reset flags, drop replay buffer, free
        // warmed agents, and start any queued run.
        let sid = session_id.clone();
        let _ = self.store_call(move |s| s.clear_in_flight(&sid)).await;
        let sid = session_id.clone();
        let _ = self.store_call(move |s| s.clear_events(&sid)).await;
        self.tasks.remove(&session_id);
        self.rooms.remove(&session_id);
        self.round_metrics.remove(&session_id);
        self.active_card_tasks.remove(&session_id);
        self.delegation_cards.remove(&session_id);
        self.delegation_responses.remove(&session_id);
        self.cleanup_session(&session_id, false);

        if let Some((_, pending)) = self.pending_runs.remove(&session_id) {
            self.run_prompt(
                &session_id,
                &pending.prompt,
                pending.personas,
                pending.start_round,
            );
        }
    }

    async fn effective_config(
        &self,
        session_config: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let mut cli: HashMap<String, Value> = HashMap::new();
        if self.config.timeout != Duration::from_secs(1800) {
            cli.insert("timeouts.idle".into(), json!(self.config.timeout.as_secs_f64()));
        }
        if self.config.parse_timeout != Duration::from_secs(1200) {
            cli.insert("timeouts.parse".into(), json!(self.config.parse_timeout.as_secs_f64()));
        }
        if self.config.send_timeout != Duration::from_secs(120) {
            cli.insert("timeouts.send".into(), json!(self.config.send_timeout.as_secs_f64()));
        }
        if let Some(hard) = self.config.hard_timeout {
            cli.insert("timeouts.hard".into(), json!(hard.as_secs_f64()));
        }
        let settings = self.settings.clone();
        let session_config = session_config.clone();
        tokio::task::spawn_blocking(move || {
            settings
                .get_effective(Some(&session_config), (!cli.is_empty()).then_some(&cli))
                .unwrap_or_default()
        })
        .await
        .unwrap_or_default()
    }

    /// Card phase auto-advancement when the assigned agent completes.
    async fn advance_card_phase(self: &Arc<Self>, session_id: &str, agent: &str, content: &str) {
        let Some(card_id) = self.active_card_tasks.get(session_id).map(|c| c.clone()) else {
            return;
        };
        let Some(engine) = self.card_engines.get(session_id).map(|e| e.clone()) else {
            return;
        };
        let advanced = engine.lock().unwrap().on_agent_completed(&card_id, agent, content);
        let (card, next_prompt) = match advanced {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id, card_id = %card_id, error = %e, "card phase advance failed");
                return;
            }
        };
        self.persist_card(session_id, &card).await;
        self.broadcast(
            session_id,
            json!({
                "type": "card_phase_completed",
                "card": card.to_wire(),
                "agent": agent,
                "next_prompt": next_prompt,
            }),
        )
        .await;

        let Some(next_prompt) = next_prompt else {
            return;
        };
        let Some(next_agent) = resolve_card_agent(&card) else {
            return;
        };

        // Schedule the next phase after a short delay so this broadcast
        // lands first; a token guards against a stale schedule firing after
        // the card moved on.
        self.cancel_next_card_phase(session_id);
        let token = self
            .card_phase_tokens
            .get(session_id)
            .map(|t| *t)
            .unwrap_or(0)
            + 1;
        self.card_phase_tokens.insert(session_id.to_string(), token);
        let expected_status = card.status;
        let runner = self.clone();
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if runner.card_phase_tokens.get(&sid).map(|t| *t) != Some(token) {
                return;
            }
            if runner.active_card_tasks.get(&sid).map(|c| c.clone()) != Some(card_id.clone()) {
                return;
            }
            let Some(engine) = runner.card_engines.get(&sid).map(|e| e.clone()) else {
                return;
            };
            let current = engine.lock().unwrap().get_card(&card_id);
            match current {
                Ok(card) if card.status == expected_status => {}
                _ => return,
            }
            runner.card_phase_tasks.remove(&sid);
            runner
                .run_card_phase(&sid, &card_id, &next_prompt, &next_agent)
                .await;
        });
        self.card_phase_tasks.insert(session_id.to_string(), task);
    }

    /// Parse delegation-round responses once the round ends.
    async fn finish_delegation(&self, session_id: &str) {
        let Some((_, card_id)) = self.delegation_cards.remove(session_id) else {
            return;
        };
        let responses = self
            .delegation_responses
            .remove(session_id)
            .map(|(_, r)| r)
            .unwrap_or_default();
        if responses.is_empty() {
            return;
        }
        let Some(engine) = self.card_engines.get(session_id).map(|e| e.clone()) else {
            return;
        };
        let parsed = engine
            .lock()
            .unwrap()
            .parse_delegation_response(&card_id, &responses);
        match parsed {
            Ok(Some(card)) => {
                self.persist_card(session_id, &card).await;
                self.broadcast(session_id, json!({"type": "card_updated", "card": card.to_wire()}))
                    .await;
                info!(
                    card_id = %card.id,
                    planner = %card.planner,
                    implementer = %card.implementer,
                    reviewer = %card.reviewer,
                    "delegation succeeded"
                );
            }
            Ok(None) => {
                warn!(card_id = %card_id, "delegation incomplete: not all roles assigned");
            }
            Err(e) => {
                warn!(session_id, card_id = %card_id, error = %e, "delegation parsing failed");
            }
        }
    }
}

/// Which agent runs the card's current phase.
fn resolve_card_agent(card: &Card) -> Option<String> {
    let name = match card.status {
        CardStatus::Coordinating => &card.coordinator,
        CardStatus::Planning => &card.planner,
        CardStatus::Implementing => &card.implementer,
        CardStatus::Reviewing => &card.reviewer,
        CardStatus::Backlog | CardStatus::Done => return None,
    };
    (!name.is_empty()).then(|| name.clone())
}

/// Reconstruct a card from its persisted wire form.
fn wire_to_card(value: &Value) -> Option<Card> {
    let history = value
        .get("history")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(CardPhaseEntry {
                        phase: CardStatus::parse(entry.get("phase")?.as_str()?)?,
                        agent: entry.get("agent")?.as_str()?.to_string(),
                        content: entry.get("content")?.as_str()?.to_string(),
                        timestamp: entry.get("timestamp")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(Card {
        id: value.get("id")?.as_str()?.to_string(),
        title: value.get("title")?.as_str()?.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        status: CardStatus::parse(value.get("status").and_then(Value::as_str).unwrap_or("backlog"))?,
        planner: value.get("planner").and_then(Value::as_str).unwrap_or("").to_string(),
        implementer: value
            .get("implementer")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        reviewer: value.get("reviewer").and_then(Value::as_str).unwrap_or("").to_string(),
        coordinator: value
            .get("coordinator")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        coordination_stage: value
            .get("coordination_stage")
            .and_then(Value::as_str)
            .and_then(CoordinationStage::parse),
        previous_phase: value
            .get("previous_phase")
            .and_then(Value::as_str)
            .and_then(CardStatus::parse),
        history,
        created_at: value
            .get("created_at")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

fn config_duration(config: &HashMap<String, Value>, key: &str) -> Option<Duration> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| *v >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Directory of helper scripts (card CLI) prepended to each subprocess PATH.
fn scripts_dir() -> String {
    if let Ok(dir) = std::env::var("MULTIAGENTS_SCRIPTS_DIR") {
        return dir;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("scripts")))
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "./scripts".to_string())
}
