use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::ProcessError;
use crate::monitor::ServerLauncher;

pub const SHUTDOWN_COMMAND: &str = "shutdown";
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const STDERR_PREFIX: &str = "ERROR: ";

const CONSOLE_BUFFER_LINES: usize = 1000;
const KILL_WAIT: Duration = Duration::from_secs(5);
const PUMP_DRAIN_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: Option<u32> },
    /// Raised once per session, whatever ended the process.
    Exited { code: Option<i32> },
}

/// Bounded console backlog plus a live feed of every appended line.
#[derive(Clone)]
pub struct ConsoleBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    tx: broadcast::Sender<String>,
    capacity: usize,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            tx,
            capacity,
        }
    }

    pub async fn push(&self, line: String) {
        {
            let mut buf = self.lines.lock().await;
            buf.push_back(line.clone());
            if buf.len() > self.capacity {
                buf.pop_front();
            }
        }
        let _ = self.tx.send(line);
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }

    pub async fn tail(&self, count: usize) -> Vec<String> {
        let buf = self.lines.lock().await;
        let skip = buf.len().saturating_sub(count);
        buf.iter().skip(skip).cloned().collect()
    }

    pub async fn clear(&self) {
        self.lines.lock().await.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

struct Session {
    stdin: Option<ChildStdin>,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

/// Identity of the live session, readable without the session lock.
#[derive(Debug, Clone, Copy)]
struct RunInfo {
    pid: Option<u32>,
    started_at: Instant,
}

impl Session {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Owns at most one OS process for a managed server.
pub struct ServerProcess {
    name: String,
    executable: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    grace_period: Duration,
    session: Mutex<Option<Session>>,
    state: Arc<watch::Sender<ProcessState>>,
    run_info: Arc<watch::Sender<Option<RunInfo>>>,
    console: ConsoleBuffer,
    events: broadcast::Sender<ProcessEvent>,
}

impl ServerProcess {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        let (run_info, _) = watch::channel(None);
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            grace_period: GRACEFUL_STOP_TIMEOUT,
            session: Mutex::new(None),
            state: Arc::new(state),
            run_info: Arc::new(run_info),
            console: ConsoleBuffer::new(CONSOLE_BUFFER_LINES),
            events,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ProcessState::Running | ProcessState::Stopping)
    }

    pub fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.console.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// PID of the live process. Never waits on a stop in progress.
    pub fn pid(&self) -> Option<u32> {
        self.run_info.borrow().and_then(|info| info.pid)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.run_info.borrow().map(|info| info.started_at.elapsed())
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.has_exited()) {
            return Err(ProcessError::AlreadyRunning);
        }

        self.console.clear().await;

        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            path: self.executable.display().to_string(),
            source: e,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        self.run_info.send_replace(Some(RunInfo {
            pid,
            started_at: Instant::now(),
        }));
        self.state.send_replace(ProcessState::Running);
        let _ = self.events.send(ProcessEvent::Started { pid });

        let stdout_task = spawn_pump(stdout, self.console.clone(), None);
        let stderr_task = spawn_pump(stderr, self.console.clone(), Some(STDERR_PREFIX));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(watch_exit(ExitWatch {
            name: self.name.clone(),
            child,
            kill: kill_rx,
            pumps: [stdout_task, stderr_task],
            exited: exited_tx,
            state: Arc::clone(&self.state),
            run_info: Arc::clone(&self.run_info),
            events: self.events.clone(),
        }));

        *session = Some(Session {
            stdin: Some(stdin),
            exited: exited_rx,
            kill: Some(kill_tx),
        });

        tracing::info!("Started server '{}' with PID {:?}", self.name, pid);
        Ok(())
    }

    /// Ask the server to shut down, escalating to a kill after the grace period.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut().filter(|s| !s.has_exited()) else {
            return Ok(());
        };

        self.state.send_replace(ProcessState::Stopping);
        tracing::info!("Stopping server '{}'", self.name);

        let message = match self.write_line(session, SHUTDOWN_COMMAND).await {
            Ok(()) => {
                let mut exited = session.exited.clone();
                let graceful = tokio::time::timeout(self.grace_period, async {
                    let _ = exited.wait_for(|done| *done).await;
                })
                .await;
                match graceful {
                    Ok(()) => "Server gracefully stopped".to_string(),
                    Err(_) => {
                        self.force_kill(session).await;
                        "Server forcefully terminated".to_string()
                    }
                }
            }
            Err(e) => {
                self.force_kill(session).await;
                format!("Error during shutdown, server forcefully terminated: {}", e)
            }
        };

        tracing::info!("Server '{}': {}", self.name, message);
        self.console.push(message).await;
        Ok(())
    }

    pub async fn send_command(&self, command: &str) -> Result<(), ProcessError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .filter(|s| !s.has_exited())
            .ok_or(ProcessError::NotRunning)?;
        self.write_line(session, command).await
    }

    /// Stop (best-effort) and release the process handle. Safe to repeat.
    pub async fn dispose(&self) {
        if let Err(e) = self.stop().await {
            tracing::warn!("Error stopping server '{}' during dispose: {}", self.name, e);
        }
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            session.stdin.take();
            if let Some(kill) = session.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    async fn write_line(&self, session: &mut Session, command: &str) -> Result<(), ProcessError> {
        let stdin = session.stdin.as_mut().ok_or(ProcessError::NotRunning)?;
        stdin.write_all(format!("{}\n", command).as_bytes()).await?;
        stdin.flush().await?;
        self.console.push(format!("Command sent: {}", command)).await;
        Ok(())
    }

    async fn force_kill(&self, session: &mut Session) {
        // The process may already be gone; nothing here is allowed to fail.
        if let Some(kill) = session.kill.take() {
            let _ = kill.send(());
        }
        let mut exited = session.exited.clone();
        let waited = tokio::time::timeout(KILL_WAIT, async {
            let _ = exited.wait_for(|done| *done).await;
        })
        .await;
        if waited.is_err() {
            tracing::warn!("Server '{}' did not exit after kill", self.name);
        }
    }
}

/// Recovery only ever starts a dead process. A live one that stopped
/// answering its API is left alone and reported as `AlreadyRunning`.
impl ServerLauncher for ServerProcess {
    fn relaunch(&self) -> BoxFuture<'_, Result<(), ProcessError>> {
        Box::pin(self.start())
    }
}

fn spawn_pump<R>(reader: R, console: ConsoleBuffer, prefix: Option<&'static str>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = match prefix {
                Some(p) => format!("{}{}", p, line),
                None => line,
            };
            console.push(line).await;
        }
    })
}

struct ExitWatch {
    name: String,
    child: Child,
    kill: oneshot::Receiver<()>,
    pumps: [JoinHandle<()>; 2],
    exited: watch::Sender<bool>,
    state: Arc<watch::Sender<ProcessState>>,
    run_info: Arc<watch::Sender<Option<RunInfo>>>,
    events: broadcast::Sender<ProcessEvent>,
}

/// Waits for the child to exit (naturally, by kill, or because its console
/// was closed) and reports it exactly once.
async fn watch_exit(exit_watch: ExitWatch) {
    let ExitWatch {
        name,
        mut child,
        mut kill,
        pumps,
        exited,
        state,
        run_info,
        events,
    } = exit_watch;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Kill of server '{}' failed: {}", name, e);
            }
            child.wait().await
        }
    };

    // Let the pumps flush what the process wrote before it died.
    let _ = tokio::time::timeout(PUMP_DRAIN_WAIT, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("Failed to wait on server '{}': {}", name, e);
            None
        }
    };

    run_info.send_replace(None);
    state.send_replace(ProcessState::Stopped);
    let _ = exited.send(true);
    let _ = events.send(ProcessEvent::Exited { code });
    tracing::info!("Server '{}' exited with code {:?}", name, code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_buffer_is_bounded() {
        let console = ConsoleBuffer::new(3);
        for i in 0..5 {
            console.push(format!("line {}", i)).await;
        }
        assert_eq!(console.snapshot().await, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(console.tail(2).await, vec!["line 3", "line 4"]);
        console.clear().await;
        assert!(console.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn console_broadcasts_lines() {
        let console = ConsoleBuffer::new(10);
        let mut rx = console.subscribe();
        console.push("hello".into()).await;
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn never_started_process_rejects_commands_and_stop_is_noop() {
        let process = ServerProcess::new("idle", "/bin/does-not-matter");
        assert_eq!(process.state(), ProcessState::NotStarted);
        assert!(matches!(
            process.send_command("save").await,
            Err(ProcessError::NotRunning)
        ));
        assert!(process.stop().await.is_ok());
        process.dispose().await;
        process.dispose().await;
        assert_eq!(process.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let process = ServerProcess::new("missing", "/definitely/not/a/real/binary");
        assert!(matches!(process.start().await, Err(ProcessError::Spawn { .. })));
        assert_eq!(process.state(), ProcessState::NotStarted);
        assert_eq!(process.pid(), None);
        assert_eq!(process.uptime(), None);
    }
}
