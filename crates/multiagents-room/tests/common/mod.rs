//! Deterministic fake participants for room tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use multiagents_agent::{AgentChunk, AgentResponse, Participant};
use multiagents_room::{ChatEvent, ChatRoom, RoomOptions};

/// Replies with a scripted response per turn ("[PASS]" once exhausted),
/// after a short fixed delay so turn interleaving is predictable.
pub struct FakeAgent {
    name: String,
    responses: Mutex<VecDeque<String>>,
    delay: Duration,
}

impl FakeAgent {
    pub fn new(name: &str, responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            delay: Duration::from_millis(10),
        })
    }
}

#[async_trait]
impl Participant for FakeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn stream(
        &self,
        _prompt: &str,
        _timeout: Duration,
        tx: mpsc::UnboundedSender<AgentChunk>,
    ) {
        tokio::time::sleep(self.delay).await;
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "[PASS]".to_string());
        let _ = tx.send(AgentChunk::Text(text.clone()));
        let _ = tx.send(AgentChunk::Response(AgentResponse {
            agent: self.name.clone(),
            response: text,
            success: true,
            latency_ms: 100.0,
            session_id: None,
            stderr: None,
        }));
    }
}

/// Streams chunks slowly so stop signals land mid-turn.
pub struct SlowAgent {
    name: String,
    delay: Duration,
}

impl SlowAgent {
    pub fn new(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl Participant for SlowAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn stream(
        &self,
        _prompt: &str,
        _timeout: Duration,
        tx: mpsc::UnboundedSender<AgentChunk>,
    ) {
        for i in 0..10 {
            if tx.send(AgentChunk::Text(format!("chunk {i} "))).is_err() {
                return;
            }
            tokio::time::sleep(self.delay / 10).await;
        }
        let _ = tx.send(AgentChunk::Response(AgentResponse {
            agent: self.name.clone(),
            response: "full response".to_string(),
            success: true,
            latency_ms: self.delay.as_secs_f64() * 1000.0,
            session_id: None,
            stderr: None,
        }));
    }
}

/// First turn streams slowly; every later turn passes immediately.
pub struct TwoPhaseAgent {
    name: String,
    delay: Duration,
    turns: Mutex<u32>,
}

impl TwoPhaseAgent {
    pub fn new(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
            turns: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Participant for TwoPhaseAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn stream(
        &self,
        _prompt: &str,
        _timeout: Duration,
        tx: mpsc::UnboundedSender<AgentChunk>,
    ) {
        let turn = {
            let mut turns = self.turns.lock().unwrap();
            *turns += 1;
            *turns
        };
        if turn == 1 {
            for _ in 0..20 {
                if tx.send(AgentChunk::Text("chunk ".to_string())).is_err() {
                    return;
                }
                tokio::time::sleep(self.delay / 20).await;
            }
            let _ = tx.send(AgentChunk::Response(AgentResponse {
                agent: self.name.clone(),
                response: "full".to_string(),
                success: true,
                latency_ms: self.delay.as_secs_f64() * 1000.0,
                session_id: None,
                stderr: None,
            }));
        } else {
            let _ = tx.send(AgentChunk::Text("[PASS]".to_string()));
            let _ = tx.send(AgentChunk::Response(AgentResponse {
                agent: self.name.clone(),
                response: "[PASS]".to_string(),
                success: true,
                latency_ms: 10.0,
                session_id: None,
                stderr: None,
            }));
        }
    }
}

pub fn room_with(agents: Vec<Arc<dyn Participant>>) -> Arc<ChatRoom> {
    ChatRoom::new(agents, RoomOptions::default(), None)
}

/// Collect room events until `until` matches one, or the deadline passes.
pub async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<ChatEvent>,
    deadline: Duration,
    until: impl Fn(&ChatEvent) -> bool,
) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    let end = tokio::time::Instant::now() + deadline;
    loop {
        let event = tokio::time::timeout_at(end, rx.recv()).await;
        match event {
            Ok(Some(event)) => {
                let stop = until(&event);
                events.push(event);
                if stop {
                    return events;
                }
            }
            _ => return events,
        }
    }
}
