//! Crash-recovery tests against real subprocesses (tiny /bin/sh fixtures).

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use multiagents_agent::adapter::{ProcessIo, ProtocolAdapter};
use multiagents_agent::error::{AgentError, Result};
use multiagents_agent::event::AgentEvent;
use multiagents_agent::launch::LaunchSpec;
use multiagents_agent::supervisor::PersistentAgent;

/// Tiny line-based JSON protocol for subprocess fixtures:
/// `{"type":"text","text":...}` streams, `{"type":"done",...}` completes.
struct LineProtocol {
    io: ProcessIo,
    session_id: Option<String>,
}

#[async_trait]
impl ProtocolAdapter for LineProtocol {
    async fn send_message(&mut self, text: &str) -> Result<()> {
        self.io.write_line(text).await
    }

    async fn stream_turn(&mut self, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<()> {
        while let Some(line) = self.io.read_line().await? {
            let Ok(obj) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            match obj.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let _ = tx.send(AgentEvent::text(
                        obj.get("text").and_then(Value::as_str).unwrap_or(""),
                    ));
                }
                Some("done") => {
                    let sid = obj
                        .get("sid")
                        .and_then(Value::as_str)
                        .unwrap_or("sid-test")
                        .to_string();
                    self.session_id = Some(sid.clone());
                    let _ = tx.send(AgentEvent::turn_complete(
                        obj.get("text").and_then(Value::as_str).unwrap_or(""),
                        Some(sid),
                    ));
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(AgentError::Protocol(
            "turn ended without completion marker".into(),
        ))
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

fn script_agent(script: &std::path::Path, args: Vec<String>) -> PersistentAgent {
    let script = script.to_path_buf();
    let fresh_script = script.clone();
    let fresh_args = args.clone();
    let build = Box::new(move || {
        let mut spec = LaunchSpec::new("sh").arg(fresh_script.display().to_string());
        for arg in &fresh_args {
            spec = spec.arg(arg.clone());
        }
        Ok(spec)
    });
    let resume = Box::new(move |_sid: &str| {
        let mut spec = LaunchSpec::new("sh").arg(script.display().to_string());
        for arg in &args {
            spec = spec.arg(arg.clone());
        }
        Ok(spec)
    });
    let make_adapter = Box::new(|io: ProcessIo| -> Box<dyn ProtocolAdapter> {
        Box::new(LineProtocol {
            io,
            session_id: None,
        })
    });
    PersistentAgent::new("test", build, resume, make_adapter)
}

/// Crashes on the first invocation (tracked via a counter file), then
/// streams a successful turn.
const FLAKY_SCRIPT: &str = r#"
counter="$1"
n=0
[ -f "$counter" ] && n=$(cat "$counter")
n=$((n+1))
printf '%s' "$n" > "$counter"
read _line
if [ "$n" = "1" ]; then
    exit 1
fi
printf '%s\n' '{"type":"text","text":"ok after restart"}'
printf '%s\n' '{"type":"done","text":"ok after restart","sid":"sid-2"}'
"#;

const ALWAYS_CRASH_SCRIPT: &str = r#"
read _line
exit 1
"#;

async fn collect_turn(
    agent: &mut PersistentAgent,
    prompt: &str,
) -> (Result<()>, Vec<AgentEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = agent.send_and_stream(prompt, &tx).await;
    drop(tx);
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    (result, events)
}

#[tokio::test(start_paused = true)]
async fn recovers_after_subprocess_crash() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("flaky_agent.sh");
    std::fs::write(&script, FLAKY_SCRIPT).unwrap();
    let counter = dir.path().join("counter.txt");

    let mut agent = script_agent(&script, vec![counter.display().to_string()]);
    let (result, events) = collect_turn(&mut agent, "hello").await;
    agent.shutdown().await;
    result.unwrap();

    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ProcessRestarted { retry: 1, .. })));
    assert!(events.iter().any(
        |e| matches!(e, AgentEvent::TextDelta { text } if text.contains("ok after restart"))
    ));
    let done = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TurnComplete { session_id, .. } => Some(session_id.clone()),
            _ => None,
        })
        .expect("turn completed");
    assert_eq!(done.as_deref(), Some("sid-2"));
    assert_eq!(agent.session_id().as_deref(), Some("sid-2"));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("always_crash.sh");
    std::fs::write(&script, ALWAYS_CRASH_SCRIPT).unwrap();

    let mut agent = script_agent(&script, vec![]);
    let (result, events) = collect_turn(&mut agent, "hello").await;
    agent.shutdown().await;

    assert!(matches!(result, Err(AgentError::RetriesExhausted(_))));
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ProcessRestarted { retry, .. } => Some(*retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2, 3]);
}
