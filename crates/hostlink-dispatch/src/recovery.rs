//! Single-flight restart of handler bindings and transport.
//!
//! Triggers arrive from any thread through [`RecoverySignal`]; the restart
//! itself runs on the main thread from the pump. The command queue is shared
//! with the restart but never replaced, so waits registered before a restart
//! stay satisfiable after it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::handler::{HandlerError, HandlerGeneration, HandlerModule};
use crate::queue::{CommandQueue, ViolationSink};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryTrigger {
    VersionChanged,
    RemoteRequest,
    ThreadAffinity,
}

impl RecoveryTrigger {
    pub const fn label(self) -> &'static str {
        match self {
            Self::VersionChanged => "version_changed",
            Self::RemoteRequest => "remote_request",
            Self::ThreadAffinity => "thread_affinity",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryPhase {
    Idle,
    RestartRequested,
    RestartInProgress,
}

impl RecoveryPhase {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RestartRequested => "restart_requested",
            Self::RestartInProgress => "restart_in_progress",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RestartOutcome {
    Completed { generation: u64 },
    Failed { error: String },
    Skipped,
}

/// Network side of a restart. Both calls must return without blocking on I/O.
pub trait TransportControl: Send + Sync {
    fn disconnect(&self);

    fn resume(&self);
}

/// Thread-safe entry point for recovery triggers, plus the restart guard.
#[derive(Debug)]
pub struct RecoverySignal {
    pending: Mutex<Option<RecoveryTrigger>>,
    restarting: AtomicBool,
    violations: AtomicU32,
    violation_threshold: u32,
}

impl RecoverySignal {
    pub fn new(violation_threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(None),
            restarting: AtomicBool::new(false),
            violations: AtomicU32::new(0),
            violation_threshold: violation_threshold.max(1),
        })
    }

    /// Records a trigger. Returns false when a restart is already pending or running.
    pub fn request(&self, trigger: RecoveryTrigger) -> bool {
        let mut pending = self.lock_pending();
        if self.restarting.load(Ordering::SeqCst) {
            info!(trigger = trigger.label(), "restart in progress; ignoring trigger");
            return false;
        }
        if let Some(existing) = *pending {
            info!(
                trigger = trigger.label(),
                pending = existing.label(),
                "restart already requested; ignoring trigger"
            );
            return false;
        }
        *pending = Some(trigger);
        info!(trigger = trigger.label(), "restart requested");
        true
    }

    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        if self.restarting.load(Ordering::SeqCst) {
            RecoveryPhase::RestartInProgress
        } else if self.lock_pending().is_some() {
            RecoveryPhase::RestartRequested
        } else {
            RecoveryPhase::Idle
        }
    }

    #[must_use]
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn violation_count(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    /// Claims the guard and the pending trigger together, so no trigger can
    /// slip in between the two.
    fn begin_pending(&self) -> Option<(RecoveryTrigger, RestartGuard<'_>)> {
        let mut pending = self.lock_pending();
        if pending.is_none() {
            return None;
        }
        let guard = self.try_begin()?;
        let trigger = pending.take()?;
        Some((trigger, guard))
    }

    /// Claims the guard for an explicit trigger, discarding any pending one.
    fn begin_now(&self) -> Option<RestartGuard<'_>> {
        let mut pending = self.lock_pending();
        let guard = self.try_begin()?;
        *pending = None;
        Some(guard)
    }

    fn try_begin(&self) -> Option<RestartGuard<'_>> {
        self.restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RestartGuard {
                flag: &self.restarting,
            })
    }

    fn reset_violations(&self) {
        self.violations.store(0, Ordering::SeqCst);
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<RecoveryTrigger>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ViolationSink for RecoverySignal {
    fn report_violation(&self, action: &str, error: &str) {
        let count = self.violations.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        warn!(
            %action,
            %error,
            count,
            threshold = self.violation_threshold,
            "thread affinity violation recorded"
        );
        if count >= self.violation_threshold {
            self.reset_violations();
            self.request(RecoveryTrigger::ThreadAffinity);
        }
    }

    fn report_clean(&self) {
        let previous = self.violations.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!(previous, "clean result; affinity violation count reset");
        }
    }
}

/// Clears the restart flag on every exit path, including unwinding.
struct RestartGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct RecoveryCoordinator {
    queue: Arc<CommandQueue>,
    signal: Arc<RecoverySignal>,
    generation: HandlerGeneration,
    observed_generation: AtomicU64,
    module: Mutex<Box<dyn HandlerModule>>,
    transport: Mutex<Option<Arc<dyn TransportControl>>>,
    restarts_completed: AtomicU64,
    restarts_failed: AtomicU64,
}

impl RecoveryCoordinator {
    pub fn new(
        queue: Arc<CommandQueue>,
        signal: Arc<RecoverySignal>,
        generation: HandlerGeneration,
        module: Box<dyn HandlerModule>,
    ) -> Self {
        let observed = generation.current();
        Self {
            queue,
            signal,
            generation,
            observed_generation: AtomicU64::new(observed),
            module: Mutex::new(module),
            transport: Mutex::new(None),
            restarts_completed: AtomicU64::new(0),
            restarts_failed: AtomicU64::new(0),
        }
    }

    /// Builds the first handler and wires violation reporting into the queue.
    pub fn initialize(&self) -> Result<(), HandlerError> {
        let handler = self.lock_module().reload()?;
        self.queue.set_handler(handler);
        self.queue.set_violation_sink(self.signal.clone());
        self.observed_generation
            .store(self.generation.current(), Ordering::SeqCst);
        Ok(())
    }

    pub fn attach_transport(&self, transport: Arc<dyn TransportControl>) {
        *self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    #[must_use]
    pub fn signal(&self) -> &Arc<RecoverySignal> {
        &self.signal
    }

    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.signal.phase()
    }

    #[must_use]
    pub fn observed_generation(&self) -> u64 {
        self.observed_generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn restarts_completed(&self) -> u64 {
        self.restarts_completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn restarts_failed(&self) -> u64 {
        self.restarts_failed.load(Ordering::SeqCst)
    }

    /// Requests a restart when the handler generation moved since the last restart.
    pub fn check_version(&self) -> bool {
        let current = self.generation.current();
        let observed = self.observed_generation();
        if current == observed {
            return false;
        }
        info!(observed, current, "handler generation changed");
        self.signal.request(RecoveryTrigger::VersionChanged)
    }

    /// Runs the pending restart, if any.
    pub fn run_pending(&self) -> Option<RestartOutcome> {
        let (trigger, guard) = self.signal.begin_pending()?;
        Some(self.restart_guarded(trigger, guard))
    }

    /// Restarts immediately unless another restart holds the guard.
    pub fn restart(&self, trigger: RecoveryTrigger) -> RestartOutcome {
        let Some(guard) = self.signal.begin_now() else {
            info!(trigger = trigger.label(), "restart already in progress; skipping");
            return RestartOutcome::Skipped;
        };
        self.restart_guarded(trigger, guard)
    }

    fn restart_guarded(&self, trigger: RecoveryTrigger, _guard: RestartGuard<'_>) -> RestartOutcome {
        info!(trigger = trigger.label(), "restart starting");
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(transport) = transport.as_ref() {
            transport.disconnect();
        }

        let rebound = panic::catch_unwind(AssertUnwindSafe(|| self.rebind_handler()));

        if let Some(transport) = transport.as_ref() {
            transport.resume();
        }
        self.signal.reset_violations();

        match rebound {
            Ok(Ok(generation)) => {
                self.restarts_completed.fetch_add(1, Ordering::SeqCst);
                info!(trigger = trigger.label(), generation, "restart completed");
                RestartOutcome::Completed { generation }
            }
            Ok(Err(restart_error)) => {
                self.restarts_failed.fetch_add(1, Ordering::SeqCst);
                error!(trigger = trigger.label(), error = %restart_error, "restart failed");
                RestartOutcome::Failed {
                    error: restart_error.to_string(),
                }
            }
            Err(_) => {
                self.restarts_failed.fetch_add(1, Ordering::SeqCst);
                error!(trigger = trigger.label(), "restart panicked");
                RestartOutcome::Failed {
                    error: "restart panicked".to_string(),
                }
            }
        }
    }

    fn rebind_handler(&self) -> Result<u64, HandlerError> {
        self.queue.clear_handler();
        let handler = {
            let mut module = self.lock_module();
            info!(module = module.name(), "reloading handler module");
            module.reload()?
        };
        self.queue.set_handler(handler);
        let generation = self.generation.bump();
        self.observed_generation.store(generation, Ordering::SeqCst);
        Ok(generation)
    }

    fn lock_module(&self) -> MutexGuard<'_, Box<dyn HandlerModule>> {
        self.module.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
