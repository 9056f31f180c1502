//! Per-connection command queue and dispatcher.
//!
//! Each bridge connection owns one [`CommandQueue`]: a FIFO of pending
//! commands plus an in-flight map of dispatched ones. The pump runs on
//! enqueue and on every completion/timeout, dispatching queue heads while
//! `in_flight < capacity`. All state transitions happen under one mutex, so
//! enqueue, dispatch, completion, timeout, and teardown are atomic with
//! respect to each other — a command reaches exactly one terminal status.
//!
//! Terminal-bound events (output chunks, results, notices) are emitted while
//! the mutex is held, which is what guarantees that no `command:output` is
//! delivered after a command's terminal-state event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CommandError, ConnectionError};
use crate::terminal::TerminalRegistry;

/// Lifecycle of a routed command. Terminal statuses are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A routed command tracked from enqueue to terminal status.
#[derive(Clone, Debug)]
pub struct Command {
    pub command_id: String,
    pub terminal_session_id: String,
    pub raw_input: String,
    pub status: CommandStatus,
    pub created_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub exit_code: Option<i32>,
}

impl Command {
    fn new(terminal_session_id: &str, raw_input: &str) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            terminal_session_id: terminal_session_id.to_string(),
            raw_input: raw_input.to_string(),
            status: CommandStatus::Queued,
            created_at: Instant::now(),
            dispatched_at: None,
            completed_at: None,
            exit_code: None,
        }
    }
}

/// Why an enqueue was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueReject {
    /// The pending queue is at `max_queue_depth`.
    QueueFull,
    /// The connection already reached a terminal state.
    BridgeClosed,
}

impl EnqueueReject {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => CommandError::QueueFull.code(),
            Self::BridgeClosed => ConnectionError::BridgeUnavailable.code(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::QueueFull => CommandError::QueueFull.message(),
            Self::BridgeClosed => ConnectionError::BridgeUnavailable.message(),
        }
    }
}

/// A dispatched command awaiting completion or timeout.
struct InFlight {
    command: Command,
    timer: AbortHandle,
    /// Set when the owning terminal session closed: output is dropped and
    /// the eventual completion is not reported anywhere.
    abandoned: bool,
}

struct QueueInner {
    queued: VecDeque<Command>,
    in_flight: HashMap<String, InFlight>,
    /// Set exactly once by [`CommandQueue::fail_all`]; enqueue rejects after.
    closed: bool,
}

/// FIFO command queue with bounded concurrency for one bridge connection.
pub struct CommandQueue {
    connection_id: String,
    capacity: usize,
    max_depth: usize,
    command_timeout: Duration,
    /// Transport handle — drained by the agent WS send task.
    agent_tx: mpsc::Sender<Value>,
    terminals: TerminalRegistry,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    #[must_use]
    pub fn new(
        connection_id: &str,
        capacity: usize,
        max_depth: usize,
        command_timeout: Duration,
        agent_tx: mpsc::Sender<Value>,
        terminals: TerminalRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: connection_id.to_string(),
            capacity,
            max_depth,
            command_timeout,
            agent_tx,
            terminals,
            inner: Mutex::new(QueueInner {
                queued: VecDeque::new(),
                in_flight: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Append a command and run the pump. Never blocks on the transport.
    ///
    /// Returns the new command id, or a rejection when the queue is at
    /// `max_queue_depth` or the connection has already gone down.
    pub async fn enqueue(
        self: &Arc<Self>,
        terminal_session_id: &str,
        raw_input: &str,
    ) -> Result<String, EnqueueReject> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EnqueueReject::BridgeClosed);
        }
        if inner.queued.len() >= self.max_depth {
            return Err(EnqueueReject::QueueFull);
        }

        let command = Command::new(terminal_session_id, raw_input);
        let command_id = command.command_id.clone();
        debug!(
            connection_id = %self.connection_id,
            command_id = %command_id,
            "Enqueued command"
        );
        inner.queued.push_back(command);
        self.pump(&mut inner).await;
        Ok(command_id)
    }

    /// Dispatch queue heads while capacity allows. Caller holds the lock.
    async fn pump(self: &Arc<Self>, inner: &mut QueueInner) {
        while inner.in_flight.len() < self.capacity {
            let Some(mut command) = inner.queued.pop_front() else {
                break;
            };
            command.status = CommandStatus::Dispatched;
            command.dispatched_at = Some(Instant::now());

            let dispatch = json!({
                "type": "command:dispatch",
                "command_id": command.command_id,
                "raw_input": command.raw_input,
            });
            if self.agent_tx.try_send(dispatch).is_err() {
                // Transport gone or saturated — typed failure, keep pumping
                // so remaining commands resolve instead of sitting forever.
                warn!(
                    connection_id = %self.connection_id,
                    command_id = %command.command_id,
                    "Transport send failed, failing command"
                );
                command.status = CommandStatus::Failed;
                command.completed_at = Some(Instant::now());
                self.terminals
                    .send_to_session(
                        &command.terminal_session_id,
                        command_result(&command, Some(ConnectionError::BridgeUnavailable.into())),
                    )
                    .await;
                continue;
            }

            let timer = self.spawn_timeout(&command.command_id);
            debug!(
                connection_id = %self.connection_id,
                command_id = %command.command_id,
                "Dispatched command"
            );
            inner.in_flight.insert(
                command.command_id.clone(),
                InFlight {
                    command,
                    timer,
                    abandoned: false,
                },
            );
        }
    }

    fn spawn_timeout(self: &Arc<Self>, command_id: &str) -> AbortHandle {
        let queue = Arc::clone(self);
        let command_id = command_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(queue.command_timeout).await;
            queue.on_timeout(&command_id).await;
        })
        .abort_handle()
    }

    /// Agent reported completion. Late or unknown completions (timed out,
    /// failed with the connection, never dispatched) are ignored.
    pub async fn complete(self: &Arc<Self>, command_id: &str, exit_code: i32) {
        let mut inner = self.inner.lock().await;
        let Some(flight) = inner.in_flight.remove(command_id) else {
            debug!(
                connection_id = %self.connection_id,
                command_id,
                "Completion for unknown or already-resolved command (ignored)"
            );
            return;
        };
        flight.timer.abort();

        let mut command = flight.command;
        command.exit_code = Some(exit_code);
        command.completed_at = Some(Instant::now());
        command.status = if exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };

        if !flight.abandoned {
            let error = (exit_code != 0).then(|| CommandError::AgentExecutionFailure.into());
            self.terminals
                .send_to_session(&command.terminal_session_id, command_result(&command, error))
                .await;
        }
        self.pump(&mut inner).await;
    }

    /// Per-command timeout fired before the agent reported completion.
    async fn on_timeout(self: &Arc<Self>, command_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(flight) = inner.in_flight.remove(command_id) else {
            return;
        };

        let mut command = flight.command;
        command.status = CommandStatus::TimedOut;
        command.completed_at = Some(Instant::now());
        warn!(
            connection_id = %self.connection_id,
            command_id,
            "Command timed out"
        );

        if !flight.abandoned {
            self.terminals
                .send_to_session(
                    &command.terminal_session_id,
                    command_result(&command, Some(CommandError::Timeout.into())),
                )
                .await;
        }
        self.pump(&mut inner).await;
    }

    /// Forward an output chunk to the terminal owning `command_id`.
    ///
    /// Chunks for unknown commands (already resolved, never dispatched) are
    /// dropped — a command in a terminal state emits no further events.
    pub async fn deliver_output(&self, command_id: &str, chunk: &str, stream: &str) {
        let inner = self.inner.lock().await;
        let Some(flight) = inner.in_flight.get(command_id) else {
            debug!(
                connection_id = %self.connection_id,
                command_id,
                "Dropped output for resolved or unknown command"
            );
            return;
        };
        if flight.abandoned {
            return;
        }
        self.terminals
            .send_to_session(
                &flight.command.terminal_session_id,
                json!({
                    "type": "command:output",
                    "command_id": command_id,
                    "chunk": chunk,
                    "stream": stream,
                }),
            )
            .await;
    }

    /// Fail every queued and in-flight command with `reason` and close the
    /// queue. Idempotent: only the first call fails anything; returns whether
    /// this call was the one that closed the queue.
    pub async fn fail_all(&self, reason: ConnectionError) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        inner.closed = true;

        let queued: Vec<Command> = inner.queued.drain(..).collect();
        let flights: Vec<InFlight> = inner.in_flight.drain().map(|(_, f)| f).collect();
        let failed = queued.len() + flights.len();

        for mut command in queued {
            command.status = CommandStatus::Failed;
            command.completed_at = Some(Instant::now());
            self.terminals
                .send_to_session(
                    &command.terminal_session_id,
                    command_result(&command, Some(reason.into())),
                )
                .await;
        }
        for flight in flights {
            flight.timer.abort();
            let mut command = flight.command;
            command.status = CommandStatus::Failed;
            command.completed_at = Some(Instant::now());
            if !flight.abandoned {
                self.terminals
                    .send_to_session(
                        &command.terminal_session_id,
                        command_result(&command, Some(reason.into())),
                    )
                    .await;
            }
        }

        if failed > 0 {
            warn!(
                connection_id = %self.connection_id,
                failed,
                reason = reason.code(),
                "Failed outstanding commands"
            );
        }
        true
    }

    /// A terminal session closed: drop its queued commands without dispatch
    /// and abandon its in-flight ones (output dropped, completion ignored —
    /// the per-command timeout remains the reaper). Returns how many queued
    /// commands were cancelled.
    pub async fn cancel_session(&self, terminal_session_id: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.queued.len();
        inner
            .queued
            .retain(|c| c.terminal_session_id != terminal_session_id);
        let cancelled = before - inner.queued.len();

        for flight in inner
            .in_flight
            .values_mut()
            .filter(|f| f.command.terminal_session_id == terminal_session_id)
        {
            flight.abandoned = true;
        }

        if cancelled > 0 {
            debug!(
                connection_id = %self.connection_id,
                terminal_session_id,
                cancelled,
                "Cancelled queued commands for closed terminal"
            );
        }
        cancelled
    }

    /// Number of queued-but-undispatched commands.
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.queued.len()
    }

    /// Number of dispatched commands awaiting resolution.
    pub async fn active(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Wire code + single-line message attached to a failed command result.
struct ResultError {
    code: &'static str,
    message: &'static str,
}

impl From<ConnectionError> for ResultError {
    fn from(e: ConnectionError) -> Self {
        Self {
            code: e.code(),
            message: e.message(),
        }
    }
}

impl From<CommandError> for ResultError {
    fn from(e: CommandError) -> Self {
        Self {
            code: e.code(),
            message: e.message(),
        }
    }
}

/// Build the terminal-facing `command:result` event for a resolved command.
fn command_result(command: &Command, error: Option<ResultError>) -> Value {
    match error {
        None => json!({
            "type": "command:result",
            "command_id": command.command_id,
            "status": command.status.as_str(),
            "exit_code": command.exit_code,
        }),
        Some(err) => json!({
            "type": "command:result",
            "command_id": command.command_id,
            "status": command.status.as_str(),
            "exit_code": command.exit_code,
            "code": err.code,
            "message": err.message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    async fn setup(
        capacity: usize,
        max_depth: usize,
    ) -> (Arc<CommandQueue>, Receiver<Value>, Receiver<Value>) {
        let terminals = TerminalRegistry::new();
        let term_rx = terminals.register("t1", "user-1").await;
        let (agent_tx, agent_rx) = mpsc::channel(64);
        let queue = CommandQueue::new(
            "conn-1",
            capacity,
            max_depth,
            Duration::from_secs(60),
            agent_tx,
            terminals,
        );
        (queue, agent_rx, term_rx)
    }

    #[tokio::test]
    async fn test_fifo_dispatch_order() {
        let (queue, mut agent_rx, _term_rx) = setup(5, 50).await;
        queue.enqueue("t1", "claude one").await.unwrap();
        queue.enqueue("t1", "claude two").await.unwrap();
        queue.enqueue("t1", "claude three").await.unwrap();

        for expected in ["claude one", "claude two", "claude three"] {
            let msg = agent_rx.recv().await.unwrap();
            assert_eq!(msg["type"], "command:dispatch");
            assert_eq!(msg["raw_input"], expected);
        }
    }

    #[tokio::test]
    async fn test_capacity_bounds_in_flight() {
        let (queue, mut agent_rx, _term_rx) = setup(2, 50).await;
        queue.enqueue("t1", "claude a").await.unwrap();
        queue.enqueue("t1", "claude b").await.unwrap();
        queue.enqueue("t1", "claude c").await.unwrap();

        let first = agent_rx.recv().await.unwrap();
        let _second = agent_rx.recv().await.unwrap();
        assert!(agent_rx.try_recv().is_err(), "third must wait for capacity");
        assert_eq!(queue.active().await, 2);
        assert_eq!(queue.depth().await, 1);

        queue
            .complete(first["command_id"].as_str().unwrap(), 0)
            .await;
        let third = agent_rx.recv().await.unwrap();
        assert_eq!(third["raw_input"], "claude c");
        assert_eq!(queue.active().await, 2);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let (queue, mut agent_rx, _term_rx) = setup(1, 1).await;
        queue.enqueue("t1", "claude a").await.unwrap(); // dispatched
        queue.enqueue("t1", "claude b").await.unwrap(); // queued
        assert_eq!(
            queue.enqueue("t1", "claude c").await.unwrap_err(),
            EnqueueReject::QueueFull
        );
        let _ = agent_rx.recv().await;
    }

    #[tokio::test]
    async fn test_completion_reports_exit_code() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude ok").await.unwrap();
        let id = agent_rx.recv().await.unwrap()["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        queue.complete(&id, 0).await;
        let result = term_rx.recv().await.unwrap();
        assert_eq!(result["type"], "command:result");
        assert_eq!(result["status"], "completed");
        assert_eq!(result["exit_code"], 0);
        assert!(result.get("code").is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_agent_failure() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude bad").await.unwrap();
        let id = agent_rx.recv().await.unwrap()["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        queue.complete(&id, 2).await;
        let result = term_rx.recv().await.unwrap();
        assert_eq!(result["status"], "failed");
        assert_eq!(result["exit_code"], 2);
        assert_eq!(result["code"], "AGENT_EXECUTION_FAILURE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_and_frees_capacity() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude slow").await.unwrap();
        queue.enqueue("t1", "claude next").await.unwrap();
        let _ = agent_rx.recv().await;

        tokio::time::sleep(Duration::from_secs(61)).await;

        let result = term_rx.recv().await.unwrap();
        assert_eq!(result["status"], "timed_out");
        assert_eq!(result["code"], "COMMAND_TIMEOUT");
        // Capacity freed — the queued command dispatched
        let next = agent_rx.recv().await.unwrap();
        assert_eq!(next["raw_input"], "claude next");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_after_timeout_is_ignored() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude slow").await.unwrap();
        let id = agent_rx.recv().await.unwrap()["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let _ = term_rx.recv().await.unwrap(); // timed_out result

        queue.complete(&id, 0).await;
        assert!(term_rx.try_recv().is_err(), "only one terminal status");
    }

    #[tokio::test]
    async fn test_no_output_after_terminal_state() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude hi").await.unwrap();
        let id = agent_rx.recv().await.unwrap()["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        queue.deliver_output(&id, "hello\n", "stdout").await;
        let out = term_rx.recv().await.unwrap();
        assert_eq!(out["type"], "command:output");
        assert_eq!(out["chunk"], "hello\n");

        queue.complete(&id, 0).await;
        let _ = term_rx.recv().await.unwrap(); // result

        queue.deliver_output(&id, "straggler\n", "stdout").await;
        assert!(term_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_all_exactly_once() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude a").await.unwrap(); // in flight
        queue.enqueue("t1", "claude b").await.unwrap(); // queued
        let _ = agent_rx.recv().await;

        assert!(queue.fail_all(ConnectionError::BridgeUnavailable).await);
        let mut failures = 0;
        while let Ok(msg) = term_rx.try_recv() {
            assert_eq!(msg["code"], "BRIDGE_UNAVAILABLE");
            failures += 1;
        }
        assert_eq!(failures, 2);

        // Second call is a no-op
        assert!(!queue.fail_all(ConnectionError::BridgeUnavailable).await);
        assert!(term_rx.try_recv().is_err());

        // Queue is closed to new work
        assert_eq!(
            queue.enqueue("t1", "claude c").await.unwrap_err(),
            EnqueueReject::BridgeClosed
        );
    }

    #[tokio::test]
    async fn test_cancel_session_drops_queued_and_abandons_in_flight() {
        let (queue, mut agent_rx, mut term_rx) = setup(1, 50).await;
        queue.enqueue("t1", "claude a").await.unwrap(); // in flight
        queue.enqueue("t1", "claude b").await.unwrap(); // queued
        let id = agent_rx.recv().await.unwrap()["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        assert_eq!(queue.cancel_session("t1").await, 1);
        assert_eq!(queue.depth().await, 0);

        // Output and completion from the abandoned command go nowhere
        queue.deliver_output(&id, "ignored\n", "stdout").await;
        queue.complete(&id, 0).await;
        assert!(term_rx.try_recv().is_err());
    }
}
