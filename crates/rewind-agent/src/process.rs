use crate::config::SupervisorConfig;
use crate::SupervisorError;
use chrono::{DateTime, Utc};
use rewind_core::{IngestReport, StreamIngestor};
use rewind_session::{ConversationHandle, TurnStart};
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 16 * 1024;
const READER_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Cancel,
    Shutdown,
}

/// Counters shared between a running turn and `Supervisor::status`.
#[derive(Debug)]
pub(crate) struct LiveProcess {
    pid: AtomicU32,
    pub(crate) started_at: DateTime<Utc>,
    bytes: AtomicU64,
    hanging: AtomicBool,
}

impl LiveProcess {
    pub(crate) fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            started_at: Utc::now(),
            bytes: AtomicU64::new(0),
            hanging: AtomicBool::new(false),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn is_hanging(&self) -> bool {
        self.hanging.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    Success,
    /// Exit code 130/143 or death by SIGINT/SIGTERM.
    Interrupted,
    Failed { code: Option<i32> },
}

#[derive(Debug)]
pub(crate) enum RunEnd {
    Exited { kind: ExitKind, stderr_tail: String },
    TimedOut,
    Stopped(StopRequest),
    Lost(io::Error),
}

pub(crate) fn classify_exit(status: ExitStatus) -> ExitKind {
    if status.success() {
        return ExitKind::Success;
    }
    match status.code() {
        Some(130) | Some(143) => ExitKind::Interrupted,
        Some(code) => ExitKind::Failed { code: Some(code) },
        None => classify_signal(status),
    }
}

#[cfg(unix)]
fn classify_signal(status: ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    const SIGINT: i32 = 2;
    const SIGTERM: i32 = 15;
    match status.signal() {
        Some(SIGINT) | Some(SIGTERM) => ExitKind::Interrupted,
        _ => ExitKind::Failed { code: None },
    }
}

#[cfg(not(unix))]
fn classify_signal(_status: ExitStatus) -> ExitKind {
    ExitKind::Failed { code: None }
}

/// Runs the agent for one turn and streams its events into the conversation queue.
/// Returns once the process is gone and its output has been drained.
pub(crate) async fn run_turn(
    config: &SupervisorConfig,
    handle: &ConversationHandle,
    start: &TurnStart,
    prompt: &str,
    live: Arc<LiveProcess>,
    mut stop_rx: oneshot::Receiver<StopRequest>,
) -> Result<RunEnd, SupervisorError> {
    let program = config
        .agent_command
        .first()
        .ok_or(SupervisorError::EmptyCommand)?;
    let mut command = Command::new(program);
    command
        .args(config.turn_args(prompt, start.resume_token.as_deref()))
        .current_dir(&start.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        program: program.clone(),
        source,
    })?;
    // Non-interactive: the agent reads nothing from us.
    drop(child.stdin.take());

    if let Some(pid) = child.id() {
        live.pid.store(pid, Ordering::Relaxed);
    }
    info!(
        event = "agent_spawned",
        conversation_id = %start.conversation_id,
        turn_id = %start.placeholder_id,
        pid = ?child.id(),
        resume = start.resume_token.is_some(),
    );

    let mut stdout_task = child.stdout.take().map(|stdout| {
        tokio::spawn(pump_stdout(
            stdout,
            StreamIngestor::new(config.ingestor.clone()),
            handle.clone(),
            live.clone(),
        ))
    });
    let mut stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(collect_tail(stderr, config.stderr_tail_lines)));

    let deadline = Instant::now() + config.turn_timeout;
    let hang_probe = sleep(config.hang_probe);
    tokio::pin!(hang_probe);
    let mut probed = false;
    let mut stop_open = true;

    let wake = loop {
        tokio::select! {
            status = child.wait() => break Wake::Exited(status),
            _ = sleep_until(deadline) => break Wake::Deadline,
            _ = &mut hang_probe, if !probed => {
                probed = true;
                if live.bytes_received() == 0 {
                    live.hanging.store(true, Ordering::Relaxed);
                    warn!(
                        event = "agent_hang_suspected",
                        conversation_id = %start.conversation_id,
                        probe_secs = config.hang_probe.as_secs(),
                    );
                }
            }
            request = &mut stop_rx, if stop_open => match request {
                Ok(request) => break Wake::Stop(request),
                Err(_) => stop_open = false,
            },
        }
    };

    let status = match wake {
        Wake::Exited(Ok(status)) => status,
        Wake::Exited(Err(err)) => {
            let _ = child.start_kill();
            drain(&mut stdout_task, &mut stderr_task).await;
            return Ok(RunEnd::Lost(err));
        }
        Wake::Deadline => {
            warn!(
                event = "agent_turn_timeout",
                conversation_id = %start.conversation_id,
                timeout_secs = config.turn_timeout.as_secs(),
            );
            terminate(&mut child).await;
            drain(&mut stdout_task, &mut stderr_task).await;
            return Ok(RunEnd::TimedOut);
        }
        Wake::Stop(request) => {
            info!(
                event = "agent_stop_requested",
                conversation_id = %start.conversation_id,
                request = ?request,
            );
            terminate(&mut child).await;
            drain(&mut stdout_task, &mut stderr_task).await;
            return Ok(RunEnd::Stopped(request));
        }
    };

    let stderr_tail = drain(&mut stdout_task, &mut stderr_task).await;
    let kind = classify_exit(status);
    info!(
        event = "agent_exited",
        conversation_id = %start.conversation_id,
        code = ?status.code(),
        exit = ?kind,
        bytes = live.bytes_received(),
    );
    Ok(RunEnd::Exited { kind, stderr_tail })
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Stop(StopRequest),
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(event = "agent_kill_failed", error = %err);
    }
    let _ = child.wait().await;
}

/// Waits for both readers to reach EOF. A reader that outlives the process, e.g.
/// because a grandchild still holds the pipe, is aborted after a short grace.
async fn drain(
    stdout_task: &mut Option<JoinHandle<()>>,
    stderr_task: &mut Option<JoinHandle<String>>,
) -> String {
    if let Some(task) = stdout_task.as_mut() {
        if timeout(READER_SETTLE, &mut *task).await.is_err() {
            task.abort();
        }
    }
    *stdout_task = None;

    let mut tail = String::new();
    if let Some(task) = stderr_task.as_mut() {
        match timeout(READER_SETTLE, &mut *task).await {
            Ok(Ok(collected)) => tail = collected,
            Ok(Err(_)) => {}
            Err(_) => task.abort(),
        }
    }
    *stderr_task = None;
    tail
}

async fn pump_stdout<R>(
    mut stdout: R,
    mut ingestor: StreamIngestor,
    handle: ConversationHandle,
    live: Arc<LiveProcess>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(
                    event = "agent_stdout_read_failed",
                    conversation_id = %handle.conversation_id(),
                    error = %err,
                );
                break;
            }
        };
        live.bytes.fetch_add(read as u64, Ordering::Relaxed);
        if !forward(&handle, ingestor.push_chunk(&buf[..read])).await {
            return;
        }
    }
    forward(&handle, ingestor.finish()).await;
}

async fn forward(handle: &ConversationHandle, report: IngestReport) -> bool {
    for err in &report.errors {
        warn!(
            event = "stream_parse_error",
            conversation_id = %handle.conversation_id(),
            error = %err,
        );
    }
    if report.rebuffered_lines > 0 {
        debug!(
            event = "stream_lines_rebuffered",
            conversation_id = %handle.conversation_id(),
            lines = report.rebuffered_lines,
        );
    }
    match handle.apply_events(report.events).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                event = "stream_events_dropped",
                conversation_id = %handle.conversation_id(),
                error = %err,
            );
            false
        }
    }
}

/// Keeps the last `max_lines` lines of a stream.
async fn collect_tail<R>(stream: R, max_lines: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut tail = VecDeque::with_capacity(max_lines);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if max_lines == 0 {
                    continue;
                }
                if tail.len() == max_lines {
                    tail.pop_front();
                }
                tail.push_back(String::from_utf8_lossy(&line).trim_end().to_string());
            }
        }
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}
