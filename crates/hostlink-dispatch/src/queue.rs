//! Correlated FIFO handing work from background threads to the main thread.
//!
//! Every queue structure (pending commands, waiter map, handler slot) sits
//! behind one coarse lock. Handlers run with the lock released; a batch takes
//! its handler snapshot in the same critical section that pops the commands,
//! so a concurrent `set_handler` never lands mid-batch.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::affinity::{MainThreadProbe, looks_like_affinity_violation};
use crate::command::{Command, CommandParams, CommandResult, FailureKind};
use crate::config::DispatchConfig;
use crate::handler::{CommandHandler, HandlerError, handler_fn};

/// Receives reports of handler results that broke main-thread affinity.
pub trait ViolationSink: Send + Sync {
    fn report_violation(&self, action: &str, error: &str);

    /// Called for every drained result that was not a violation.
    fn report_clean(&self) {}
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub executed: u64,
    pub handler_failures: u64,
    pub affinity_violations: u64,
    pub timeouts: u64,
    pub late_results_dropped: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClearOutcome {
    pub dropped_commands: usize,
    pub cancelled_waits: usize,
}

struct QueueState {
    pending: VecDeque<Command>,
    waits: HashMap<Uuid, SyncSender<CommandResult>>,
    handler: Option<Arc<dyn CommandHandler>>,
    violation_sink: Option<Arc<dyn ViolationSink>>,
    last_drain_at: Option<Instant>,
    stats: QueueStats,
}

pub struct CommandQueue {
    config: DispatchConfig,
    probe: Arc<dyn MainThreadProbe>,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new(config: DispatchConfig, probe: Arc<dyn MainThreadProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                waits: HashMap::new(),
                handler: None,
                violation_sink: None,
                last_drain_at: None,
                stats: QueueStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        self.probe.is_main_thread()
    }

    /// Queues a command and blocks the calling thread until the main thread
    /// has executed it or `timeout` elapses.
    ///
    /// Refuses to block when called on the main thread, since the drain it
    /// would be waiting for could never run.
    pub fn enqueue_and_wait(
        &self,
        action: impl Into<String>,
        parameters: CommandParams,
        timeout: Duration,
    ) -> CommandResult {
        let command = Command::new(action, parameters);
        let id = command.id;

        if self.probe.is_main_thread() {
            warn!(
                request_id = %id,
                action = %command.action,
                "enqueue_and_wait called on the main thread; refusing to block"
            );
            return CommandResult::failed(
                id.to_string(),
                FailureKind::Dispatch,
                "enqueue_and_wait called on the main thread would deadlock",
            );
        }

        let (signal_tx, signal_rx) = mpsc::sync_channel::<CommandResult>(1);
        {
            let mut state = self.lock_state();
            state.waits.insert(id, signal_tx);
            state.pending.push_back(command);
            state.stats.enqueued = state.stats.enqueued.saturating_add(1);
        }

        match signal_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let still_waiting = {
                    let mut state = self.lock_state();
                    let removed = state.waits.remove(&id).is_some();
                    if removed {
                        state.stats.timeouts = state.stats.timeouts.saturating_add(1);
                    }
                    removed
                };
                if !still_waiting {
                    // The drain claimed the waiter just before the deadline.
                    if let Ok(result) = signal_rx.try_recv() {
                        return result;
                    }
                }
                debug!(request_id = %id, ?timeout, "command wait timed out");
                CommandResult::timed_out(id.to_string(), timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.lock_state().waits.remove(&id);
                CommandResult::failed(id.to_string(), FailureKind::Dispatch, "command wait cancelled")
            }
        }
    }

    /// Queues a command without waiting; its result is discarded after the drain.
    pub fn enqueue(&self, action: impl Into<String>, parameters: CommandParams) -> Uuid {
        let command = Command::new(action, parameters);
        let id = command.id;
        let mut state = self.lock_state();
        state.pending.push_back(command);
        state.stats.enqueued = state.stats.enqueued.saturating_add(1);
        id
    }

    /// Executes up to `max_batch` queued commands. Main thread only.
    pub fn drain(&self, max_batch: usize) -> usize {
        if max_batch == 0 {
            return 0;
        }
        if !self.probe.is_main_thread() {
            warn!("drain called off the main thread; skipping");
            return 0;
        }

        let (batch, handler, sink) = {
            let mut state = self.lock_state();
            if state.pending.is_empty() {
                return 0;
            }
            let now = Instant::now();
            if state
                .last_drain_at
                .is_some_and(|last| now.duration_since(last) < self.config.min_drain_interval)
            {
                return 0;
            }
            state.last_drain_at = Some(now);
            let take = max_batch.min(state.pending.len());
            let batch = state.pending.drain(..take).collect::<Vec<_>>();
            (batch, state.handler.clone(), state.violation_sink.clone())
        };

        let executed = batch.len();
        for command in batch {
            let result = execute_command(handler.as_deref(), &command);
            if result.is_thread_affinity_violation() {
                let error = result.error.as_deref().unwrap_or_default();
                warn!(
                    request_id = %command.id,
                    action = %command.action,
                    %error,
                    "handler reported a thread affinity violation"
                );
                if let Some(sink) = sink.as_ref() {
                    sink.report_violation(&command.action, error);
                }
            } else {
                if !result.success {
                    debug!(
                        request_id = %command.id,
                        action = %command.action,
                        error = result.error.as_deref().unwrap_or_default(),
                        "command failed"
                    );
                }
                if let Some(sink) = sink.as_ref() {
                    sink.report_clean();
                }
            }
            self.deliver(command.id, result);
        }
        executed
    }

    pub fn set_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.lock_state().handler = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.lock_state().handler = None;
    }

    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.lock_state().handler.is_some()
    }

    pub fn set_violation_sink(&self, sink: Arc<dyn ViolationSink>) {
        self.lock_state().violation_sink = Some(sink);
    }

    /// Drops every queued command and fails every outstanding wait.
    ///
    /// Reserved for controlled shutdown; recovery restarts leave the queue alone.
    pub fn clear_all(&self, reason: &str) -> ClearOutcome {
        let (dropped_commands, waits) = {
            let mut state = self.lock_state();
            let dropped = state.pending.len();
            state.pending.clear();
            let waits = state.waits.drain().collect::<Vec<_>>();
            (dropped, waits)
        };
        let cancelled_waits = waits.len();
        for (id, signal) in waits {
            let _ = signal.try_send(CommandResult::failed(
                id.to_string(),
                FailureKind::Dispatch,
                reason,
            ));
        }
        if dropped_commands > 0 || cancelled_waits > 0 {
            warn!(dropped_commands, cancelled_waits, %reason, "command queue cleared");
        }
        ClearOutcome {
            dropped_commands,
            cancelled_waits,
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock_state().waits.len()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.lock_state().stats
    }

    fn deliver(&self, id: Uuid, result: CommandResult) {
        let waiter = {
            let mut state = self.lock_state();
            state.stats.executed = state.stats.executed.saturating_add(1);
            if !result.success && result.failure != Some(FailureKind::Dispatch) {
                state.stats.handler_failures = state.stats.handler_failures.saturating_add(1);
            }
            if result.is_thread_affinity_violation() {
                state.stats.affinity_violations = state.stats.affinity_violations.saturating_add(1);
            }
            state.waits.remove(&id)
        };

        let Some(waiter) = waiter else {
            return;
        };
        if waiter.try_send(result).is_err() {
            let mut state = self.lock_state();
            state.stats.late_results_dropped = state.stats.late_results_dropped.saturating_add(1);
            debug!(request_id = %id, "waiter gone before result delivery");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn execute_command(handler: Option<&dyn CommandHandler>, command: &Command) -> CommandResult {
    let request_id = command.id.to_string();
    let Some(handler) = handler else {
        return CommandResult::failed(request_id, FailureKind::Dispatch, "no handler registered");
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle(&command.action, &command.parameters)
    }));
    match outcome {
        Ok(Ok(data)) => CommandResult::ok(request_id, data),
        Ok(Err(error @ HandlerError::ThreadAffinity(_))) => {
            CommandResult::failed(request_id, FailureKind::ThreadAffinity, error.to_string())
        }
        Ok(Err(error)) => {
            let message = error.to_string();
            let kind = if looks_like_affinity_violation(&message) {
                FailureKind::ThreadAffinity
            } else {
                FailureKind::Handler
            };
            CommandResult::failed(request_id, kind, message)
        }
        Err(payload) => CommandResult::failed(
            request_id,
            FailureKind::Handler,
            format!("handler panicked: {}", panic_message(payload.as_ref())),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Handler that answers every action with `Value::Null`; useful as a placeholder binding.
pub fn null_handler() -> Arc<dyn CommandHandler> {
    handler_fn(|_action, _params| Ok(Value::Null))
}
