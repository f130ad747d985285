//! Chat-level agent wrapper: translates supervisor events into the chunk
//! stream the chat room consumes, under a per-turn budget.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use multiagents_core::{AgentKind, AgentPersona, PermissionMode};

use crate::adapter::ProtocolAdapter;
use crate::claude::ClaudeAdapter;
use crate::codex::CodexAdapter;
use crate::event::{AgentEvent, PermissionResponse};
use crate::kimi::KimiAdapter;
use crate::labels::{display_label, truncate_chars};
use crate::launch::{claude_launch, codex_launch, kimi_launch, KimiAgentFiles, LaunchSpec};
use crate::permission::PermissionBridge;
use crate::prompt::build_agent_system_prompt;
use crate::supervisor::PersistentAgent;

/// In-band notice from an agent (e.g. process restart), shown to users.
#[derive(Debug, Clone)]
pub struct AgentNotice {
    pub agent: String,
    pub message: String,
}

/// Permission request with the owning agent's name attached.
#[derive(Debug, Clone)]
pub struct AgentPermissionRequest {
    pub agent: String,
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub description: String,
}

/// Terminal result of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub agent: String,
    pub response: String,
    pub success: bool,
    pub latency_ms: f64,
    pub session_id: Option<String>,
    pub stderr: Option<String>,
}

/// One item of an agent's turn stream.
#[derive(Debug, Clone)]
pub enum AgentChunk {
    /// Display text: response deltas plus `<thinking>`/`<tool>`/... tags.
    Text(String),
    Notice(AgentNotice),
    Permission(AgentPermissionRequest),
    /// Terminal item; nothing follows it for this turn.
    Response(AgentResponse),
}

/// Seam between the chat room and concrete agents, so room logic can be
/// driven by fakes in tests.
#[async_trait]
pub trait Participant: Send + Sync {
    fn name(&self) -> &str;

    fn parse_timeout(&self) -> Duration;

    fn hard_timeout(&self) -> Option<Duration> {
        None
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    /// Run one turn; chunks (ending with `AgentChunk::Response`) go to `tx`.
    async fn stream(&self, prompt: &str, timeout: Duration, tx: mpsc::UnboundedSender<AgentChunk>);

    /// Best-effort cancellation of the current turn.
    async fn cancel_turn(&self) {}

    async fn respond_to_permission(&self, _response: PermissionResponse) {}

    async fn shutdown(&self) {}
}

/// Runtime-adjustable agent settings (model overrides, budgets, env).
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: Option<String>,
    pub system_prompt_override: Option<String>,
    pub project_dir: Option<String>,
    pub parse_timeout: Duration,
    pub hard_timeout: Option<Duration>,
    pub permission_mode: PermissionMode,
    pub permission_timeout: Duration,
    pub extra_env: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt_override: None,
            project_dir: None,
            parse_timeout: Duration::from_secs(1200),
            hard_timeout: None,
            permission_mode: PermissionMode::Bypass,
            permission_timeout: Duration::from_secs(120),
            extra_env: HashMap::new(),
        }
    }
}

/// A persistent-pipe CLI agent as seen by the chat room.
pub struct ChatAgent {
    persona: AgentPersona,
    settings: Arc<Mutex<AgentSettings>>,
    supervisor: tokio::sync::Mutex<PersistentAgent>,
    permissions: Arc<PermissionBridge>,
    last_session_id: Mutex<Option<String>>,
    /// Isolated scratch cwd for agents without a project dir (Claude only).
    work_dir: Arc<Mutex<Option<tempfile::TempDir>>>,
}

impl ChatAgent {
    pub fn new(persona: AgentPersona, settings: AgentSettings) -> Self {
        let settings = Arc::new(Mutex::new(settings));
        let permissions = Arc::new(PermissionBridge::new());
        let kimi_files = Arc::new(KimiAgentFiles::new());
        let work_dir = Arc::new(Mutex::new(None));
        // Kimi owns its session ids client-side; pick one up front so fresh
        // spawns and crash resumes agree.
        let kimi_session = uuid::Uuid::new_v4().to_string();

        let supervisor = Self::build_supervisor(
            &persona,
            settings.clone(),
            permissions.clone(),
            kimi_files,
            kimi_session,
            work_dir.clone(),
        );

        Self {
            persona,
            settings,
            supervisor: tokio::sync::Mutex::new(supervisor),
            permissions,
            last_session_id: Mutex::new(None),
            work_dir,
        }
    }

    pub fn persona(&self) -> &AgentPersona {
        &self.persona
    }

    pub fn kind(&self) -> AgentKind {
        self.persona.kind
    }

    /// Mutate settings (model, timeouts, env) for subsequent spawns/turns.
    pub fn update_settings(&self, update: impl FnOnce(&mut AgentSettings)) {
        let mut settings = self.settings.lock().unwrap();
        update(&mut settings);
    }

    pub fn settings_snapshot(&self) -> AgentSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Seed the CLI session id (restored from the store) for resume.
    pub async fn set_session_id(&self, session_id: Option<String>) {
        *self.last_session_id.lock().unwrap() = session_id.clone();
        self.supervisor.lock().await.set_session_id(session_id);
    }

    /// Remove the scratch working directory, if one was created.
    pub fn cleanup(&self) {
        self.work_dir.lock().unwrap().take();
    }

    fn build_supervisor(
        persona: &AgentPersona,
        settings: Arc<Mutex<AgentSettings>>,
        permissions: Arc<PermissionBridge>,
        kimi_files: Arc<KimiAgentFiles>,
        kimi_session: String,
        work_dir: Arc<Mutex<Option<tempfile::TempDir>>>,
    ) -> PersistentAgent {
        let name = persona.name.clone();
        let kind = persona.kind;

        let launch_settings = settings.clone();
        let launch_name = name.clone();
        let launch_files = kimi_files.clone();
        let launch_session = kimi_session.clone();
        let launch_work_dir = work_dir.clone();
        let build_launch = Box::new(move || {
            build_spec(
                kind,
                &launch_name,
                &launch_settings.lock().unwrap().clone(),
                &launch_files,
                None,
                &launch_session,
                &launch_work_dir,
            )
        });

        let resume_settings = settings.clone();
        let resume_name = name.clone();
        let resume_files = kimi_files;
        let resume_session = kimi_session;
        let build_resume = Box::new(move |sid: &str| {
            build_spec(
                kind,
                &resume_name,
                &resume_settings.lock().unwrap().clone(),
                &resume_files,
                Some(sid),
                &resume_session,
                &work_dir,
            )
        });

        let adapter_settings = settings;
        let make_adapter = Box::new(move |io| -> Box<dyn ProtocolAdapter> {
            let snapshot = adapter_settings.lock().unwrap().clone();
            match kind {
                AgentKind::Claude => Box::new(ClaudeAdapter::new(io)),
                AgentKind::Codex => {
                    let (policy, sandbox) = codex_policy(snapshot.permission_mode);
                    Box::new(CodexAdapter::new(io, policy, sandbox))
                }
                AgentKind::Kimi => Box::new(
                    KimiAdapter::new(io, snapshot.permission_mode, snapshot.permission_timeout)
                        .with_permissions(permissions.clone()),
                ),
            }
        });

        PersistentAgent::new(name, build_launch, build_resume, make_adapter)
    }

}

fn codex_policy(mode: PermissionMode) -> (&'static str, &'static str) {
    match mode {
        PermissionMode::Bypass => ("never", "danger-full-access"),
        PermissionMode::Auto | PermissionMode::Manual => ("untrusted", "workspace-write"),
    }
}

fn build_spec(
    kind: AgentKind,
    name: &str,
    settings: &AgentSettings,
    kimi_files: &KimiAgentFiles,
    resume_session: Option<&str>,
    kimi_session: &str,
    work_dir: &Mutex<Option<tempfile::TempDir>>,
) -> crate::error::Result<LaunchSpec> {
    let system_prompt = build_agent_system_prompt(
        settings.project_dir.as_deref(),
        settings.system_prompt_override.as_deref(),
        Some(name),
    );
    let mut spec = match kind {
        AgentKind::Claude => claude_launch(
            &system_prompt,
            settings.model.as_deref(),
            settings.permission_mode,
            resume_session,
        ),
        AgentKind::Codex => codex_launch(&system_prompt, settings.model.as_deref()),
        AgentKind::Kimi => {
            let agent_file = kimi_files.ensure(
                settings.model.as_deref(),
                settings.system_prompt_override.as_deref(),
                settings.project_dir.as_deref(),
                name,
            )?;
            let session = resume_session.unwrap_or(kimi_session);
            kimi_launch(&agent_file, session, settings.permission_mode)
        }
    };
    spec.env.extend(settings.extra_env.clone());
    if let Some(dir) = &settings.project_dir {
        spec.cwd = Some(PathBuf::from(dir));
    } else if kind == AgentKind::Claude {
        // No project dir: keep Claude in an isolated scratch directory so
        // relative writes can't land in the server's cwd.
        let mut guard = work_dir.lock().unwrap();
        if guard.is_none() {
            *guard = Some(
                tempfile::Builder::new()
                    .prefix("multiagents-claude-")
                    .tempdir()?,
            );
        }
        spec.cwd = guard.as_ref().map(|d| d.path().to_path_buf());
    }
    Ok(spec)
}

/// Render a tool badge tag the frontend shows inline.
fn tool_badge(tool_name: &str, detail: &str) -> String {
    let label = display_label(tool_name);
    let body = if detail.is_empty() {
        label.to_string()
    } else {
        format!("{label} {detail}").trim().to_string()
    };
    format!("<tool>{body}</tool>\n")
}

#[async_trait]
impl Participant for ChatAgent {
    fn name(&self) -> &str {
        &self.persona.name
    }

    fn parse_timeout(&self) -> Duration {
        self.settings.lock().unwrap().parse_timeout
    }

    fn hard_timeout(&self) -> Option<Duration> {
        self.settings.lock().unwrap().hard_timeout
    }

    fn session_id(&self) -> Option<String> {
        self.last_session_id.lock().unwrap().clone()
    }

    async fn stream(&self, prompt: &str, timeout: Duration, tx: mpsc::UnboundedSender<AgentChunk>) {
        let start = Instant::now();
        let settings = self.settings_snapshot();

        let mut turn_timeout = timeout;
        if settings.parse_timeout > Duration::ZERO {
            turn_timeout = turn_timeout.min(settings.parse_timeout);
        }

        let mut supervisor = self.supervisor.lock().await;
        let stderr = supervisor.stderr_handle();

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let mut streamed_text = String::new();
        let mut completed: Option<AgentResponse> = None;

        let turn = async {
            let mut drive_result: Option<crate::error::Result<()>> = None;
            {
                let drive = supervisor.send_and_stream(prompt, &ev_tx);
                tokio::pin!(drive);
                loop {
                    tokio::select! {
                        res = &mut drive, if drive_result.is_none() => {
                            drive_result = Some(res);
                        }
                        ev = ev_rx.recv() => {
                            match ev {
                                Some(ev) => self.translate(
                                    ev, &tx, &mut streamed_text, &mut completed,
                                    start, &stderr,
                                ),
                                None => break,
                            }
                        }
                    }
                    if drive_result.is_some() {
                        // Drain anything still buffered, then stop.
                        while let Ok(ev) = ev_rx.try_recv() {
                            self.translate(ev, &tx, &mut streamed_text, &mut completed, start, &stderr);
                        }
                        break;
                    }
                }
            }
            drive_result.unwrap_or(Ok(()))
        };

        match tokio::time::timeout(turn_timeout, turn).await {
            Ok(Ok(())) => {
                if let Some(response) = completed.take() {
                    if let Some(sid) = response.session_id.clone() {
                        *self.last_session_id.lock().unwrap() = Some(sid);
                    }
                    let _ = tx.send(AgentChunk::Response(response));
                }
            }
            Ok(Err(e)) => {
                warn!(agent = %self.persona.name, error = %e, "persistent stream error");
                let _ = tx.send(AgentChunk::Response(AgentResponse {
                    agent: self.persona.name.clone(),
                    response: e.to_string(),
                    success: false,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    session_id: None,
                    stderr: None,
                }));
            }
            Err(_) => {
                warn!(
                    agent = %self.persona.name,
                    timeout_secs = turn_timeout.as_secs_f64(),
                    "persistent turn timed out"
                );
                if let Err(e) = supervisor.cancel().await {
                    debug!(agent = %self.persona.name, error = %e, "cancel after timeout failed");
                }
                let stderr_text = stderr.text();
                let _ = tx.send(AgentChunk::Response(AgentResponse {
                    agent: self.persona.name.clone(),
                    response: "Timeout".to_string(),
                    success: false,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    session_id: None,
                    stderr: (!stderr_text.is_empty()).then_some(stderr_text),
                }));
            }
        }
    }

    async fn cancel_turn(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if let Err(e) = supervisor.cancel().await {
            debug!(agent = %self.persona.name, error = %e, "cancel_turn failed");
        }
    }

    async fn respond_to_permission(&self, response: PermissionResponse) {
        self.permissions.resolve(response);
    }

    async fn shutdown(&self) {
        self.supervisor.lock().await.shutdown().await;
        self.cleanup();
    }
}

impl ChatAgent {
    #[allow(clippy::too_many_arguments)]
    fn translate(
        &self,
        event: AgentEvent,
        tx: &mpsc::UnboundedSender<AgentChunk>,
        streamed_text: &mut String,
        completed: &mut Option<AgentResponse>,
        start: Instant,
        stderr: &crate::supervisor::StderrHandle,
    ) {
        match event {
            AgentEvent::TextDelta { text } => {
                streamed_text.push_str(&text);
                let _ = tx.send(AgentChunk::Text(text));
            }
            AgentEvent::ThinkingDelta { text } => {
                let _ = tx.send(AgentChunk::Text(format!("<thinking>{text}</thinking>\n")));
            }
            AgentEvent::ToolBadge { label, detail } => {
                let _ = tx.send(AgentChunk::Text(tool_badge(&label, &detail)));
            }
            AgentEvent::ToolOutput { text, .. } => {
                let _ = tx.send(AgentChunk::Text(format!(
                    "<tool_output>{}</tool_output>\n",
                    truncate_chars(&text, 500)
                )));
            }
            AgentEvent::ToolResult {
                tool_name,
                success,
                output,
            } => {
                let tag = if success { "result" } else { "error" };
                let label = display_label(&tool_name);
                let detail = truncate_chars(&output, 200);
                let body = if detail.is_empty() {
                    label.to_string()
                } else {
                    format!("{label} {detail}").trim().to_string()
                };
                let _ = tx.send(AgentChunk::Text(format!("<{tag}>{body}</{tag}>\n")));
            }
            AgentEvent::ProcessRestarted { retry, .. } => {
                let _ = tx.send(AgentChunk::Notice(AgentNotice {
                    agent: self.persona.name.clone(),
                    message: format!("persistent process restarted (retry {retry})"),
                }));
            }
            AgentEvent::PermissionRequest {
                request_id,
                tool_name,
                tool_input,
                description,
            } => {
                let _ = tx.send(AgentChunk::Permission(AgentPermissionRequest {
                    agent: self.persona.name.clone(),
                    request_id,
                    tool_name,
                    tool_input,
                    description,
                }));
            }
            AgentEvent::TurnComplete {
                text,
                session_id,
                success,
                error,
            } => {
                let mut response_text = if text.is_empty() {
                    streamed_text.clone()
                } else {
                    text
                };
                if response_text.is_empty() {
                    if let Some(err) = &error {
                        response_text = err.clone();
                    }
                }
                let stderr_text = stderr.text();
                let previous = self.last_session_id.lock().unwrap().clone();
                *completed = Some(AgentResponse {
                    agent: self.persona.name.clone(),
                    response: response_text,
                    success,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    session_id: session_id.or(previous),
                    stderr: (!stderr_text.is_empty()).then_some(stderr_text),
                });
            }
        }
    }
}
