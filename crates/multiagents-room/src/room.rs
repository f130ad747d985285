//! Chat room state and control surface shared by both dispatch modes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use multiagents_agent::{AgentResponse, Participant, PermissionResponse};
use multiagents_core::HistoryMessage;

use crate::prompts::{format_incoming_event, format_session_context, ParticipantInfo, PERSISTENT_REPLY_DIRECTIVE};
use crate::share::normalize_relay_text;

pub(crate) const RELAY_DEDUP_COOLDOWN: Duration = Duration::from_secs(8);
pub(crate) const RELAY_DEDUP_MAX_ENTRIES: usize = 2048;
pub(crate) const DM_DEBOUNCE: Duration = Duration::from_millis(500);

/// One message waiting in an agent's inbox.
#[derive(Debug, Clone)]
pub struct InboxItem {
    /// "user", "system", "dm", or another agent's name.
    pub sender: String,
    pub message: String,
    pub round: Option<u64>,
    pub delivery_id: Option<String>,
}

/// Sender side of an agent inbox, with a depth counter so the settlement
/// check can observe emptiness.
pub(crate) struct Inbox {
    pub tx: mpsc::UnboundedSender<InboxItem>,
    pub depth: Arc<AtomicUsize>,
}

struct DmBuffer {
    texts: Vec<String>,
    deadline: Instant,
}

/// Optional per-agent context sections injected into prompts
/// (e.g. memory, task board). Returns ordered (key, text) pairs.
pub type ContextProvider = Box<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;

pub struct RoomOptions {
    /// Idle per-turn budget.
    pub timeout: Duration,
    /// Personas shown to each agent as "other participants".
    pub participants: Option<Vec<ParticipantInfo>>,
    /// Role line per agent name.
    pub roles: HashMap<String, String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            participants: None,
            roles: HashMap::new(),
        }
    }
}

/// The concurrent message-passing fabric between user, system, and agents.
///
/// Construction wires the queues; actual dispatch happens in
/// [`run_persistent`](ChatRoom::run_persistent) or [`run`](ChatRoom::run).
pub struct ChatRoom {
    pub(crate) timeout: Duration,
    pub(crate) agents: Mutex<Vec<Arc<dyn Participant>>>,
    pub(crate) history: Mutex<Vec<HistoryMessage>>,
    pub(crate) context_provider: Option<ContextProvider>,
    pub(crate) participants: Option<Vec<ParticipantInfo>>,
    pub(crate) roles: HashMap<String, String>,

    pub(crate) user_queue: Mutex<VecDeque<String>>,
    pub(crate) system_queue: Mutex<VecDeque<String>>,
    pub(crate) restart_queue: Mutex<VecDeque<(String, String)>>,
    pub(crate) add_queue: Mutex<VecDeque<Arc<dyn Participant>>>,
    pub(crate) remove_queue: Mutex<VecDeque<String>>,
    dm_buffers: Mutex<HashMap<String, DmBuffer>>,

    pub(crate) stop_tokens: Mutex<HashMap<String, CancellationToken>>,
    pub(crate) resume_flag: AtomicBool,
    pub(crate) any_stopped: AtomicBool,
    pub(crate) pause_on_stop: AtomicBool,
    /// Cancels the whole room (both pump and agent loops).
    pub(crate) cancel: CancellationToken,

    pub(crate) inboxes: Mutex<HashMap<String, Inbox>>,
    recent_relays: Mutex<HashMap<(String, String, String), Instant>>,
    delivery_seq: AtomicU64,
    pub(crate) delivery_pending: Mutex<HashMap<String, HashSet<String>>>,
}

impl ChatRoom {
    pub fn new(
        agents: Vec<Arc<dyn Participant>>,
        options: RoomOptions,
        context_provider: Option<ContextProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            timeout: options.timeout,
            agents: Mutex::new(agents),
            history: Mutex::new(Vec::new()),
            context_provider,
            participants: options.participants,
            roles: options.roles,
            user_queue: Mutex::new(VecDeque::new()),
            system_queue: Mutex::new(VecDeque::new()),
            restart_queue: Mutex::new(VecDeque::new()),
            add_queue: Mutex::new(VecDeque::new()),
            remove_queue: Mutex::new(VecDeque::new()),
            dm_buffers: Mutex::new(HashMap::new()),
            stop_tokens: Mutex::new(HashMap::new()),
            resume_flag: AtomicBool::new(false),
            any_stopped: AtomicBool::new(false),
            pause_on_stop: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            inboxes: Mutex::new(HashMap::new()),
            recent_relays: Mutex::new(HashMap::new()),
            delivery_seq: AtomicU64::new(0),
            delivery_pending: Mutex::new(HashMap::new()),
        })
    }

    // -- External control ---------------------------------------------------

    pub fn inject_user_message(&self, text: impl Into<String>) {
        self.user_queue.lock().unwrap().push_back(text.into());
    }

    pub fn inject_system_message(&self, text: impl Into<String>) {
        self.system_queue.lock().unwrap().push_back(text.into());
    }

    /// Stop a single agent mid-round.
    pub fn stop_agent(&self, name: &str) {
        if let Some(token) = self.stop_tokens.lock().unwrap().get(name) {
            token.cancel();
        }
    }

    /// Stop all running agents in the current round.
    pub fn stop_round(&self, pause: bool) {
        self.pause_on_stop.store(pause, Ordering::SeqCst);
        for token in self.stop_tokens.lock().unwrap().values() {
            token.cancel();
        }
    }

    /// Resume after a paused round.
    pub fn resume(&self) {
        self.resume_flag.store(true, Ordering::SeqCst);
    }

    /// Cancel the room entirely; both run modes unwind.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue an agent to join. Mid-round it joins immediately.
    pub fn add_agent(&self, agent: Arc<dyn Participant>) {
        self.add_queue.lock().unwrap().push_back(agent);
    }

    /// Queue an agent for removal, stopping it if mid-round.
    pub fn remove_agent(&self, name: &str) {
        self.remove_queue.lock().unwrap().push_back(name.to_string());
        self.stop_agent(name);
    }

    /// Forward a permission decision to the named agent.
    pub fn respond_to_permission(&self, agent_name: &str, response: PermissionResponse) {
        let agent = self
            .agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.name() == agent_name)
            .cloned();
        if let Some(agent) = agent {
            tokio::spawn(async move { agent.respond_to_permission(response).await });
        }
    }

    /// Queue a DM for an agent.
    ///
    /// Multiple DMs within the debounce window are coalesced into a single
    /// inbox item with the texts joined by newlines.
    pub fn restart_agent(&self, name: &str, dm_text: impl Into<String>) {
        let mut buffers = self.dm_buffers.lock().unwrap();
        let buffer = buffers.entry(name.to_string()).or_insert_with(|| DmBuffer {
            texts: Vec::new(),
            deadline: Instant::now() + DM_DEBOUNCE,
        });
        buffer.texts.push(dm_text.into());
        buffer.deadline = Instant::now() + DM_DEBOUNCE;
    }

    pub fn set_history(&self, history: Vec<HistoryMessage>) {
        *self.history.lock().unwrap() = history;
    }

    pub fn history_snapshot(&self) -> Vec<HistoryMessage> {
        self.history.lock().unwrap().clone()
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    // -- DM debounce --------------------------------------------------------

    /// Move DM buffers whose quiet period elapsed into the restart queue.
    /// Driven by the pump, which wakes at least every 100 ms.
    pub(crate) fn fire_due_dm_buffers(&self) {
        let now = Instant::now();
        let mut fired: Vec<(String, String)> = Vec::new();
        {
            let mut buffers = self.dm_buffers.lock().unwrap();
            let due: Vec<String> = buffers
                .iter()
                .filter(|(_, b)| b.deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in due {
                if let Some(buffer) = buffers.remove(&name) {
                    fired.push((name, buffer.texts.join("\n")));
                }
            }
        }
        let mut queue = self.restart_queue.lock().unwrap();
        for entry in fired {
            queue.push_back(entry);
        }
    }

    /// Whether any DM text is still accumulating (debounce not yet fired).
    pub(crate) fn dm_buffers_pending(&self) -> bool {
        !self.dm_buffers.lock().unwrap().is_empty()
    }

    pub(crate) fn dm_buffer_pending_for(&self, name: &str) -> bool {
        self.dm_buffers.lock().unwrap().contains_key(name)
    }

    /// Cancel pending debounce buffers, discarding accumulated texts.
    pub(crate) fn clear_dm_buffers(&self) {
        self.dm_buffers.lock().unwrap().clear();
    }

    pub(crate) fn drain_restart_queue(&self) {
        self.restart_queue.lock().unwrap().clear();
    }

    // -- Stop tokens --------------------------------------------------------

    pub(crate) fn stop_token(&self, name: &str) -> CancellationToken {
        self.stop_tokens
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Fresh token after a handled stop so the next turn starts clean.
    pub(crate) fn reset_stop_token(&self, name: &str) {
        self.stop_tokens
            .lock()
            .unwrap()
            .insert(name.to_string(), CancellationToken::new());
    }

    pub(crate) fn reset_all_stop_tokens(&self, names: &[String]) {
        let mut tokens = self.stop_tokens.lock().unwrap();
        tokens.clear();
        for name in names {
            tokens.insert(name.clone(), CancellationToken::new());
        }
    }

    // -- Deliveries ---------------------------------------------------------

    fn next_delivery_id(&self) -> String {
        let seq = self.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("d{seq}")
    }

    /// Fan a message out to `recipients`' inboxes under one delivery id.
    pub(crate) fn enqueue_delivery(
        &self,
        sender: &str,
        message: &str,
        round: Option<u64>,
        recipients: &[String],
    ) -> Option<String> {
        if recipients.is_empty() {
            return None;
        }
        let delivery_id = self.next_delivery_id();
        self.delivery_pending
            .lock()
            .unwrap()
            .insert(delivery_id.clone(), recipients.iter().cloned().collect());
        let inboxes = self.inboxes.lock().unwrap();
        for recipient in recipients {
            if let Some(inbox) = inboxes.get(recipient) {
                inbox.depth.fetch_add(1, Ordering::SeqCst);
                let _ = inbox.tx.send(InboxItem {
                    sender: sender.to_string(),
                    message: message.to_string(),
                    round,
                    delivery_id: Some(delivery_id.clone()),
                });
            }
        }
        Some(delivery_id)
    }

    /// Record a dequeue; emits `AgentDeliveryAcked` and clears tracking when
    /// the whole recipient set acked.
    pub(crate) fn ack_delivery(
        &self,
        event_tx: &mpsc::UnboundedSender<Option<crate::events::ChatEvent>>,
        item: &InboxItem,
        recipient: &str,
    ) {
        let Some(delivery_id) = &item.delivery_id else {
            return;
        };
        {
            let mut pending = self.delivery_pending.lock().unwrap();
            let Some(recipients) = pending.get_mut(delivery_id) else {
                return;
            };
            if !recipients.remove(recipient) {
                return;
            }
            if recipients.is_empty() {
                pending.remove(delivery_id);
            }
        }
        let _ = event_tx.send(Some(crate::events::ChatEvent::AgentDeliveryAcked {
            delivery_id: delivery_id.clone(),
            recipient: recipient.to_string(),
            sender: item.sender.clone(),
            round_number: item.round,
        }));
    }

    /// Drop a removed agent from every pending recipient set.
    pub(crate) fn drop_agent_pending_deliveries(&self, name: &str) {
        let mut pending = self.delivery_pending.lock().unwrap();
        pending.retain(|_, recipients| {
            recipients.remove(name);
            !recipients.is_empty()
        });
    }

    // -- Relay dedup --------------------------------------------------------

    fn prune_recent_relays(&self, relays: &mut HashMap<(String, String, String), Instant>, now: Instant) {
        relays.retain(|_, ts| now.duration_since(*ts) < RELAY_DEDUP_COOLDOWN);
        if relays.len() <= RELAY_DEDUP_MAX_ENTRIES {
            return;
        }
        // Keep the most recent entries only.
        let mut ordered: Vec<_> = relays.drain().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        ordered.truncate(RELAY_DEDUP_MAX_ENTRIES);
        relays.extend(ordered);
    }

    /// Gate a relay: true registers the attempt, false means the same
    /// (sender, target, text) fired within the cooldown window.
    pub(crate) fn should_relay_share(&self, sender: &str, target: &str, shareable: &str) -> bool {
        let now = Instant::now();
        let mut relays = self.recent_relays.lock().unwrap();
        self.prune_recent_relays(&mut relays, now);
        let normalized = normalize_relay_text(shareable);
        if normalized.is_empty() {
            return false;
        }
        let key = (sender.to_lowercase(), target.to_lowercase(), normalized);
        if let Some(last) = relays.get(&key) {
            if now.duration_since(*last) < RELAY_DEDUP_COOLDOWN {
                return false;
            }
        }
        relays.insert(key, now);
        true
    }

    pub(crate) fn clear_runtime_state(&self) {
        self.stop_tokens.lock().unwrap().clear();
        self.inboxes.lock().unwrap().clear();
        self.recent_relays.lock().unwrap().clear();
        self.delivery_pending.lock().unwrap().clear();
        debug!("room runtime state cleared");
    }

    // -- Persistent prompt formatting ---------------------------------------

    fn session_prelude(&self, agent_name: &str) -> String {
        let extra = self
            .context_provider
            .as_ref()
            .map(|provider| provider(agent_name))
            .unwrap_or_default();
        let role = self.roles.get(agent_name).cloned().unwrap_or_default();
        let context = format_session_context(agent_name, self.participants.as_deref(), &role);
        let extra_sections = {
            let joined = extra
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
                .join("\n\n");
            if joined.is_empty() {
                joined
            } else {
                format!("{joined}\n\n")
            }
        };
        format!("{context}\n\n{extra_sections}")
    }

    fn format_persistent_single(&self, item: &InboxItem, prelude: &str) -> String {
        match item.sender.as_str() {
            "user" => format!(
                "{prelude}## Incoming Event\n[User]: {}\n\n{PERSISTENT_REPLY_DIRECTIVE}",
                item.message
            ),
            "dm" => format!(
                "{prelude}## Direct Message from User\n{}\n\n\
Treat this as a targeted directive for you.\n{PERSISTENT_REPLY_DIRECTIVE}",
                item.message
            ),
            "system" => format!(
                "{prelude}## Incoming Event\n[System]: {}\n\n{PERSISTENT_REPLY_DIRECTIVE}",
                item.message
            ),
            sender => format!(
                "{prelude}## Incoming Event\n[{}] shared:\n{}\n\n\
Only respond if you can add net-new value or concrete next action.\n{PERSISTENT_REPLY_DIRECTIVE}",
                capitalize_sender(sender),
                item.message
            ),
        }
    }

    /// Build the event-style prompt for one batch of inbox items.
    pub(crate) fn format_persistent_events_prompt(
        &self,
        agent_name: &str,
        batch: &[InboxItem],
        is_first_message: bool,
    ) -> String {
        let prelude = if is_first_message {
            self.session_prelude(agent_name)
        } else {
            String::new()
        };

        if batch.len() == 1 {
            return self.format_persistent_single(&batch[0], &prelude);
        }

        let incoming = batch
            .iter()
            .map(|item| format_incoming_event(&item.sender, &item.message))
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "{prelude}## Incoming Events\n{incoming}\n\n\
Respond once to the combined context. Prioritize direct user requests.\n{PERSISTENT_REPLY_DIRECTIVE}"
        )
    }
}

fn capitalize_sender(sender: &str) -> String {
    let mut chars = sender.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Make a failed response shell for stopped/timed-out/errored turns.
pub(crate) fn failed_response(agent: &str, text: impl Into<String>) -> AgentResponse {
    AgentResponse {
        agent: agent.to_string(),
        response: text.into(),
        success: false,
        latency_ms: 0.0,
        session_id: None,
        stderr: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_room() -> Arc<ChatRoom> {
        ChatRoom::new(Vec::new(), RoomOptions::default(), None)
    }

    #[tokio::test]
    async fn relay_dedup_suppresses_within_cooldown() {
        let room = empty_room();
        assert!(room.should_relay_share("claude", "codex", "Use a   monorepo"));
        // Same triple, whitespace/case variations — suppressed.
        assert!(!room.should_relay_share("Claude", "Codex", "use a monorepo"));
        // Different recipient — allowed.
        assert!(room.should_relay_share("claude", "kimi", "use a monorepo"));
        // Empty after normalization — never relayed.
        assert!(!room.should_relay_share("claude", "codex", "   "));
    }

    #[tokio::test]
    async fn delivery_ack_clears_pending_when_all_recipients_ack() {
        let room = empty_room();
        let (tx_a, mut _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut _rx_b) = mpsc::unbounded_channel();
        {
            let mut inboxes = room.inboxes.lock().unwrap();
            inboxes.insert("a".into(), Inbox { tx: tx_a, depth: Arc::new(AtomicUsize::new(0)) });
            inboxes.insert("b".into(), Inbox { tx: tx_b, depth: Arc::new(AtomicUsize::new(0)) });
        }
        let delivery_id = room
            .enqueue_delivery("user", "hello", Some(1), &["a".into(), "b".into()])
            .unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let item = InboxItem {
            sender: "user".into(),
            message: "hello".into(),
            round: Some(1),
            delivery_id: Some(delivery_id.clone()),
        };
        room.ack_delivery(&event_tx, &item, "a");
        assert!(room.delivery_pending.lock().unwrap().contains_key(&delivery_id));
        room.ack_delivery(&event_tx, &item, "b");
        assert!(!room.delivery_pending.lock().unwrap().contains_key(&delivery_id));

        // Exactly one ack event per recipient; a re-ack is ignored.
        room.ack_delivery(&event_tx, &item, "a");
        drop(event_tx);
        let mut acks = 0;
        while let Some(ev) = event_rx.recv().await {
            if matches!(ev, Some(crate::events::ChatEvent::AgentDeliveryAcked { .. })) {
                acks += 1;
            }
        }
        assert_eq!(acks, 2);
    }

    #[tokio::test]
    async fn dm_debounce_coalesces_texts() {
        let room = empty_room();
        room.restart_agent("claude", "first");
        room.restart_agent("claude", "second");

        // Not yet due.
        room.fire_due_dm_buffers();
        assert!(room.restart_queue.lock().unwrap().is_empty());
        assert!(room.dm_buffer_pending_for("claude"));

        tokio::time::sleep(DM_DEBOUNCE + Duration::from_millis(50)).await;
        room.fire_due_dm_buffers();
        let fired = room.restart_queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(fired.0, "claude");
        assert_eq!(fired.1, "first\nsecond");
        assert!(!room.dm_buffers_pending());
    }
}
