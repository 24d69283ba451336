//! Controller-side worker proxy (spec §4.1): presents a request/response and
//! streaming API to the controller while isolating the native inference
//! backend in a supervised child process.
//!
//! Grounded in the teacher's `WorkerBridge` (stdin-writer task +
//! stdout-reader task over `tokio::sync::mpsc`/`oneshot`, pending-request
//! table keyed by correlation id, `reconnect_io` after a restart),
//! generalized from a single-generation `ActiveGeneration` slot to the full
//! `{id, type, payload}` envelope surface and the supervised-restart policy
//! (budgeted restarts, terminal dead state) that the teacher's bridge did
//! not need because it lacked a service boundary that could legitimately
//! crash mid-request.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex, Notify};

use super::process_manager::{ProcessManager, RESTART_DELAY};
use crate::envelope::{decode, encode, Command, CorrelationId, Request, Response, ResponseBody, STREAM_COMPLETE};
use crate::error::{CoreError, CoreResult};

pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One chunk of a streaming response, or its terminal outcome.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Error(CoreError),
}

enum PendingSlot {
    Single(oneshot::Sender<ResponseBody>),
    Stream(mpsc::UnboundedSender<ResponseBody>),
}

type PendingTable = Arc<TokioMutex<HashMap<CorrelationId, PendingSlot>>>;

struct Inner {
    cmd_tx: TokioMutex<mpsc::UnboundedSender<String>>,
    pending: PendingTable,
    next_id: AtomicU64,
    process_manager: Arc<ProcessManager>,
    initialized: Notify,
    is_initialized: AtomicBool,
}

/// Process-wide resource (spec §9, "global worker singleton"); callers are
/// expected to hold it behind an `Arc` and call [`WorkerProxy::terminate`]
/// explicitly rather than relying on `Drop` for cleanup ordering.
#[derive(Clone)]
pub struct WorkerProxy {
    inner: Arc<Inner>,
}

impl WorkerProxy {
    /// Spawn the worker and start its IO tasks, then send `init`.
    pub async fn spawn() -> CoreResult<Self> {
        let process_manager = Arc::new(ProcessManager::spawn().map_err(|_| CoreError::WorkerUnavailable)?);
        let proxy = Self::from_process_manager(process_manager);
        proxy.send(Command::Init, CONTROL_TIMEOUT).await?;
        proxy.inner.is_initialized.store(true, Ordering::SeqCst);
        proxy.inner.initialized.notify_waiters();
        Ok(proxy)
    }

    fn from_process_manager(process_manager: Arc<ProcessManager>) -> Self {
        let stdin = process_manager.take_stdin().expect("worker stdin not available");
        let stdout = process_manager.take_stdout().expect("worker stdout not available");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingTable = Arc::new(TokioMutex::new(HashMap::new()));

        let inner = Arc::new(Inner {
            cmd_tx: TokioMutex::new(cmd_tx),
            pending,
            next_id: AtomicU64::new(1),
            process_manager,
            initialized: Notify::new(),
            is_initialized: AtomicBool::new(false),
        });

        tokio::spawn(stdin_writer_task(cmd_rx, stdin));
        tokio::spawn(stdout_reader_task(stdout, WorkerProxy { inner: inner.clone() }));

        Self { inner }
    }

    /// Reconnect stdin/stdout tasks to a freshly restarted child process,
    /// then re-send `init` so worker-side state starts clean (spec §4.1:
    /// "after a successful restart, a fresh init is sent; prior correlation
    /// ids are discarded").
    async fn reconnect_io(&self) {
        if let Some(stdin) = self.inner.process_manager.take_stdin() {
            let (new_cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(stdin_writer_task(cmd_rx, stdin));
            *self.inner.cmd_tx.lock().await = new_cmd_tx;
        }
        if let Some(stdout) = self.inner.process_manager.take_stdout() {
            tokio::spawn(stdout_reader_task(stdout, self.clone()));
        }
        let _ = self.send(Command::Init, CONTROL_TIMEOUT).await;
    }

    /// Returns once the worker has acknowledged `init`. Pending calls issued
    /// before this resolves still queue and proceed in order (spec §4.1):
    /// the command channel's FIFO ordering serializes them behind `init`.
    pub async fn wait_for_initialization(&self) {
        if self.inner.is_initialized.load(Ordering::SeqCst) {
            return;
        }
        self.inner.initialized.notified().await;
    }

    fn next_correlation_id(&self) -> CorrelationId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `send(type, payload, deadline) → result` (spec §4.1).
    pub async fn send(&self, command: Command, deadline: Duration) -> CoreResult<serde_json::Value> {
        if self.inner.process_manager.is_dead() {
            return Err(CoreError::WorkerUnavailable);
        }

        let id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, PendingSlot::Single(tx));

        self.write_envelope(id, command).await?;

        let is_generation = deadline >= GENERATION_TIMEOUT;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(body)) => match body {
                ResponseBody::Terminal { success: true, data, .. } => Ok(data.unwrap_or(serde_json::Value::Null)),
                ResponseBody::Terminal { success: false, error, .. } => {
                    Err(CoreError::from_wire(&error.unwrap_or_default()))
                }
                _ => Err(CoreError::InvalidPayload("unexpected response body".into())),
            },
            Ok(Err(_)) => Err(CoreError::WorkerCrashed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                if is_generation {
                    self.send_fire_and_forget(Command::AbortGeneration { target_id: id }).await;
                }
                Err(CoreError::Timeout)
            }
        }
    }

    /// `sendStream(type, payload, deadline) → chunk sequence` (spec §4.1).
    /// Returns a receiver yielding [`StreamEvent::Chunk`]s in order,
    /// terminated by exactly one [`StreamEvent::Done`] or
    /// [`StreamEvent::Error`]. The returned correlation id is what
    /// [`WorkerProxy::abort`] takes to cancel the stream.
    pub async fn send_stream(
        &self,
        command: Command,
        deadline: Duration,
    ) -> CoreResult<(CorrelationId, mpsc::UnboundedReceiver<StreamEvent>)> {
        if self.inner.process_manager.is_dead() {
            return Err(CoreError::WorkerUnavailable);
        }

        let id = self.next_correlation_id();
        let (body_tx, mut body_rx) = mpsc::unbounded_channel::<ResponseBody>();
        self.inner.pending.lock().await.insert(id, PendingSlot::Stream(body_tx));

        self.write_envelope(id, command).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<StreamEvent>();
        let proxy = self.clone();

        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(deadline, body_rx.recv()).await {
                    Ok(Some(ResponseBody::StreamChunk { data })) => {
                        if event_tx.send(StreamEvent::Chunk(data)).is_err() {
                            break;
                        }
                    }
                    Ok(Some(ResponseBody::Terminal { success: true, .. })) => {
                        let _ = event_tx.send(StreamEvent::Done);
                        break;
                    }
                    Ok(Some(ResponseBody::Terminal { success: false, error, .. })) => {
                        let _ = event_tx.send(StreamEvent::Error(CoreError::from_wire(&error.unwrap_or_default())));
                        break;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        let _ = event_tx.send(StreamEvent::Error(CoreError::WorkerCrashed));
                        break;
                    }
                    Err(_) => {
                        proxy.inner.pending.lock().await.remove(&id);
                        proxy.send_fire_and_forget(Command::AbortGeneration { target_id: id }).await;
                        let _ = event_tx.send(StreamEvent::Error(CoreError::Timeout));
                        break;
                    }
                }
            }
        });

        Ok((id, event_rx))
    }

    /// Send `abortGeneration` for a correlation id returned by
    /// [`WorkerProxy::send_stream`]. Idempotent (spec §8).
    pub async fn abort(&self, target_id: CorrelationId) {
        self.send_fire_and_forget(Command::AbortGeneration { target_id }).await;
    }

    async fn send_fire_and_forget(&self, command: Command) {
        let id = self.next_correlation_id();
        let request = Request { id, command };
        if let Ok(json) = encode(&request) {
            let _ = self.inner.cmd_tx.lock().await.send(json);
        }
    }

    async fn write_envelope(&self, id: CorrelationId, command: Command) -> CoreResult<()> {
        let request = Request { id, command };
        let json = encode(&request).map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
        self.inner.cmd_tx.lock().await.send(json).map_err(|_| CoreError::WorkerUnavailable)
    }

    /// Abort all in-flight requests and ask the worker to exit.
    pub async fn terminate(&self) {
        self.send_fire_and_forget(Command::Shutdown).await;
        reject_all(&self.inner.pending, "terminated").await;
        self.inner.process_manager.kill();
    }

    pub fn is_alive(&self) -> bool {
        self.inner.process_manager.is_alive()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.process_manager.is_dead()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.process_manager.restart_count()
    }
}

async fn reject_all(pending: &PendingTable, message: &str) {
    let mut guard = pending.lock().await;
    for (_, slot) in guard.drain() {
        let body = ResponseBody::Terminal { success: false, data: None, error: Some(message.to_string()) };
        match slot {
            PendingSlot::Single(tx) => {
                let _ = tx.send(body);
            }
            PendingSlot::Stream(tx) => {
                let _ = tx.send(body);
            }
        }
    }
}

async fn stdin_writer_task(mut cmd_rx: mpsc::UnboundedReceiver<String>, mut stdin: std::process::ChildStdin) {
    while let Some(json_line) = cmd_rx.recv().await {
        if writeln!(stdin, "{json_line}").is_err() {
            log::warn!("failed to write to worker stdin");
            break;
        }
        if stdin.flush().is_err() {
            log::warn!("failed to flush worker stdin");
            break;
        }
    }
}

async fn stdout_reader_task(stdout: std::process::ChildStdout, proxy: WorkerProxy) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if line_tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("worker stdout read error: {e}");
                    break;
                }
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let response: Response = match decode(&line) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("failed to parse worker response: {e}");
                continue;
            }
        };

        // Worker-initiated reverse-bridge envelopes are not replies to a
        // pending request; a host embedding this proxy subscribes to them
        // separately (spec §4.7). This loop only demultiplexes replies.
        if matches!(response.body, ResponseBody::McpToolsRequest | ResponseBody::ExecuteMcpTool { .. }) {
            continue;
        }

        let mut guard = proxy.inner.pending.lock().await;
        let is_terminal = matches!(response.body, ResponseBody::Terminal { .. });
        match guard.get(&response.id) {
            Some(PendingSlot::Stream(tx)) => {
                let _ = tx.send(response.body);
                if is_terminal {
                    guard.remove(&response.id);
                }
            }
            Some(PendingSlot::Single(_)) => {
                if let Some(PendingSlot::Single(tx)) = guard.remove(&response.id) {
                    let _ = tx.send(response.body);
                }
            }
            None => {
                if response.id != 0 {
                    log::warn!("no pending request for response id={}", response.id);
                }
            }
        }
    }

    // stdout closed: the worker process has exited (spec §4.1 supervision).
    reject_all(&proxy.inner.pending, "worker crashed").await;
    proxy.inner.process_manager.check_alive();
    log::error!("worker process exited unexpectedly");

    if proxy.inner.process_manager.is_dead() {
        return;
    }

    tokio::time::sleep(RESTART_DELAY).await;
    match proxy.inner.process_manager.restart() {
        Ok(()) => proxy.reconnect_io().await,
        Err(_) => log::error!("worker restart budget exhausted; proxy is now dead"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_deadline_threshold_is_five_minutes() {
        assert_eq!(GENERATION_TIMEOUT, Duration::from_secs(300));
    }
}
