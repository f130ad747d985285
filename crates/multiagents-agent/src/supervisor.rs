//! Long-lived agent subprocess with crash recovery.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{ProcessIo, ProtocolAdapter};
use crate::error::{AgentError, Result};
use crate::event::AgentEvent;
use crate::launch::LaunchSpec;
use crate::permission::PermissionBridge;

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Lines of stderr retained for diagnostics.
const STDERR_RING_CAPACITY: usize = 400;

/// Clonable view of a supervisor's stderr ring buffer.
#[derive(Clone)]
pub struct StderrHandle(Arc<Mutex<VecDeque<String>>>);

impl StderrHandle {
    pub fn text(&self) -> String {
        self.0
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("")
    }
}

pub type LaunchFn = Box<dyn Fn() -> Result<LaunchSpec> + Send + Sync>;
pub type ResumeLaunchFn = Box<dyn Fn(&str) -> Result<LaunchSpec> + Send + Sync>;
pub type AdapterFn = Box<dyn Fn(ProcessIo) -> Box<dyn ProtocolAdapter> + Send + Sync>;

/// Wraps a `ProtocolAdapter` with process lifecycle management.
///
/// The process stays alive between turns. If it dies mid-turn, it is
/// respawned with session-resume args and the failed message is retried
/// with exponential backoff, up to [`MAX_RETRIES`] times.
pub struct PersistentAgent {
    agent_name: String,
    build_launch: LaunchFn,
    build_resume_launch: ResumeLaunchFn,
    make_adapter: AdapterFn,
    child: Option<Child>,
    adapter: Option<Box<dyn ProtocolAdapter>>,
    session_id: Option<String>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_buffer: Arc<Mutex<VecDeque<String>>>,
}

impl PersistentAgent {
    pub fn new(
        agent_name: impl Into<String>,
        build_launch: LaunchFn,
        build_resume_launch: ResumeLaunchFn,
        make_adapter: AdapterFn,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            build_launch,
            build_resume_launch,
            make_adapter,
            child: None,
            adapter: None,
            session_id: None,
            stderr_task: None,
            stderr_buffer: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    /// Seed a session id (e.g. restored from the store) before the first spawn.
    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// Accumulated stderr of the current process generation.
    pub fn stderr_text(&self) -> String {
        self.stderr_handle().text()
    }

    /// Cheap handle onto the stderr ring, readable while a turn is in flight.
    pub fn stderr_handle(&self) -> StderrHandle {
        StderrHandle(self.stderr_buffer.clone())
    }

    pub fn permission_bridge(&self) -> Option<Arc<PermissionBridge>> {
        self.adapter.as_ref().and_then(|a| a.permission_bridge())
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the process and run the protocol handshake if not already live.
    ///
    /// Handshake failures propagate — the next turn retries from scratch.
    pub async fn ensure_running(&mut self) -> Result<()> {
        if self.is_running() && self.adapter.is_some() {
            return Ok(());
        }

        let spec = match self.session_id.as_deref() {
            Some(sid) => (self.build_resume_launch)(sid)?,
            None => (self.build_launch)()?,
        };
        info!(agent = %self.agent_name, spawn = %spec.preview(), "spawning persistent process");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| AgentError::Spawn {
            command: spec.program.clone(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Protocol("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Protocol("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Protocol("child stderr not captured".into()))?;

        // Drain stderr in the background to prevent pipe buffer deadlock.
        self.stderr_buffer.lock().unwrap().clear();
        let buffer = self.stderr_buffer.clone();
        let agent_name = self.agent_name.clone();
        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(agent = %agent_name, stderr = %line, "subprocess stderr");
                let mut ring = buffer.lock().unwrap();
                if ring.len() >= STDERR_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(format!("{line}\n"));
            }
        }));

        self.child = Some(child);

        let io = ProcessIo::new(Box::new(stdin), Box::new(stdout));
        let mut adapter = (self.make_adapter)(io);
        match self.session_id.as_deref() {
            Some(sid) => adapter.start_resume(sid).await?,
            None => adapter.start().await?,
        }
        self.adapter = Some(adapter);
        Ok(())
    }

    /// Send a message and stream response events into `tx`, with crash
    /// recovery. Returns after the adapter delivered its `TurnComplete`.
    pub async fn send_and_stream(
        &mut self,
        prompt: &str,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let mut retries: u32 = 0;
        loop {
            self.ensure_running().await?;
            let adapter = self
                .adapter
                .as_mut()
                .ok_or_else(|| AgentError::NotReady("adapter missing after spawn".into()))?;

            let attempt: Result<()> = async {
                adapter.send_message(prompt).await?;
                adapter.stream_turn(tx).await
            }
            .await;

            match attempt {
                Ok(()) => {
                    if let Some(sid) = self.adapter.as_ref().and_then(|a| a.session_id()) {
                        self.session_id = Some(sid);
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        error!(agent = %self.agent_name, "max retries exceeded after process crash");
                        return Err(AgentError::RetriesExhausted(e.to_string()));
                    }
                    let backoff = BACKOFF_BASE * 2u32.pow(retries - 1);
                    warn!(
                        agent = %self.agent_name,
                        error = %e,
                        backoff_secs = backoff.as_secs_f64(),
                        retry = retries,
                        max = MAX_RETRIES,
                        "process died, respawning"
                    );
                    let _ = tx.send(AgentEvent::ProcessRestarted {
                        reason: e.to_string(),
                        retry: retries,
                    });
                    tokio::time::sleep(backoff).await;
                    self.teardown_process().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Interrupt the current turn.
    pub async fn cancel(&mut self) -> Result<()> {
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.cancel().await?;
        }
        Ok(())
    }

    /// Kill a stale process and drop the adapter so the next turn respawns.
    async fn teardown_process(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.adapter = None;
    }

    /// Graceful shutdown: adapter close, stderr drain cancel, SIGTERM, then
    /// SIGKILL after the grace period.
    pub async fn shutdown(&mut self) {
        if let Some(adapter) = self.adapter.as_mut() {
            if let Err(e) = adapter.shutdown().await {
                debug!(agent = %self.agent_name, error = %e, "adapter shutdown failed");
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                if let Some(pid) = child.id() {
                    // SIGTERM first so the CLI can flush session state.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
        }

        self.adapter = None;
    }
}
