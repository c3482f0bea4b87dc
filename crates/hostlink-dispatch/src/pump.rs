use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::queue::CommandQueue;
use crate::recovery::{RecoveryCoordinator, RestartOutcome};

/// The host's main-thread scheduling primitive.
///
/// Implementations call `tick` repeatedly on the main thread until they decide
/// to stop, typically once per frame or timer callback.
pub trait TickHost {
    fn run(&mut self, tick: &mut dyn FnMut());
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    pub drained: usize,
    pub version_checked: bool,
    pub restart: Option<RestartOutcome>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PumpStats {
    pub ticks: u64,
    pub drained: u64,
    pub drain_panics: u64,
    pub restarts_run: u64,
}

/// Per-tick driver: drain the queue, then give recovery its turn.
pub struct DispatchPump {
    queue: Arc<CommandQueue>,
    coordinator: Arc<RecoveryCoordinator>,
    last_version_check: Option<Instant>,
    stats: PumpStats,
}

impl DispatchPump {
    pub fn new(coordinator: Arc<RecoveryCoordinator>) -> Self {
        Self {
            queue: Arc::clone(coordinator.queue()),
            coordinator,
            last_version_check: None,
            stats: PumpStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    /// Suggested delay between ticks for hosts that poll on a timer.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.queue
            .config()
            .min_drain_interval
            .max(Duration::from_millis(1))
    }

    pub fn tick(&mut self) -> TickReport {
        self.stats.ticks = self.stats.ticks.saturating_add(1);
        let max_batch = self.queue.config().max_batch;
        let queue = Arc::clone(&self.queue);
        let drained = match panic::catch_unwind(AssertUnwindSafe(|| queue.drain(max_batch))) {
            Ok(drained) => drained,
            Err(_) => {
                self.stats.drain_panics = self.stats.drain_panics.saturating_add(1);
                error!("command drain panicked; pump stays scheduled");
                0
            }
        };
        self.stats.drained = self.stats.drained.saturating_add(drained as u64);

        let version_checked = self.version_check_due();
        if version_checked {
            self.last_version_check = Some(Instant::now());
            self.coordinator.check_version();
        }

        let coordinator = Arc::clone(&self.coordinator);
        let restart = match panic::catch_unwind(AssertUnwindSafe(|| coordinator.run_pending())) {
            Ok(restart) => restart,
            Err(_) => {
                error!("pending restart panicked");
                Some(RestartOutcome::Failed {
                    error: "restart panicked".to_string(),
                })
            }
        };
        if let Some(outcome) = restart.as_ref() {
            self.stats.restarts_run = self.stats.restarts_run.saturating_add(1);
            debug!(?outcome, "pump ran a pending restart");
        }

        TickReport {
            drained,
            version_checked,
            restart,
        }
    }

    pub fn run_on(&mut self, host: &mut dyn TickHost) {
        host.run(&mut || {
            self.tick();
        });
    }

    fn version_check_due(&self) -> bool {
        let interval = self.queue.config().version_check_interval;
        self.last_version_check
            .is_none_or(|checked_at| checked_at.elapsed() >= interval)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{DispatchPump, TickHost};
    use crate::affinity::MainThreadProbe;
    use crate::command::CommandParams;
    use crate::config::DispatchConfig;
    use crate::handler::{CommandHandler, HandlerError, HandlerGeneration, HandlerModule, handler_fn};
    use crate::queue::CommandQueue;
    use crate::recovery::{RecoveryCoordinator, RecoverySignal, RecoveryTrigger, RestartOutcome};

    struct EchoModule;

    impl HandlerModule for EchoModule {
        fn name(&self) -> &str {
            "echo"
        }

        fn reload(&mut self) -> Result<Arc<dyn CommandHandler>, HandlerError> {
            Ok(handler_fn(|_, params| Ok(json!(params))))
        }
    }

    fn pump_with(
        config: DispatchConfig,
        probe: Arc<dyn MainThreadProbe>,
        generation: HandlerGeneration,
    ) -> (DispatchPump, Arc<RecoveryCoordinator>) {
        let queue = CommandQueue::new(config, probe);
        let coordinator = Arc::new(RecoveryCoordinator::new(
            queue,
            RecoverySignal::new(2),
            generation,
            Box::new(EchoModule),
        ));
        coordinator.initialize().expect("initial handler");
        (DispatchPump::new(Arc::clone(&coordinator)), coordinator)
    }

    fn zero_interval_config() -> DispatchConfig {
        DispatchConfig {
            min_drain_interval: Duration::ZERO,
            version_check_interval: Duration::ZERO,
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn tick_drains_up_to_the_batch_cap() {
        let config = DispatchConfig {
            max_batch: 2,
            ..zero_interval_config()
        };
        let (mut pump, coordinator) = pump_with(config, Arc::new(|| true), HandlerGeneration::new());
        for _ in 0..3 {
            coordinator.queue().enqueue("echo", CommandParams::new());
        }
        assert_eq!(pump.tick().drained, 2);
        assert_eq!(pump.tick().drained, 1);
        assert_eq!(pump.stats().drained, 3);
    }

    #[test]
    fn drain_panic_does_not_stop_the_pump() {
        let (mut pump, coordinator) = pump_with(
            zero_interval_config(),
            Arc::new(|| -> bool { panic!("probe exploded") }),
            HandlerGeneration::new(),
        );
        coordinator.queue().enqueue("echo", CommandParams::new());
        let report = pump.tick();
        assert_eq!(report.drained, 0);
        let report = pump.tick();
        assert_eq!(report.drained, 0);
        assert_eq!(pump.stats().drain_panics, 2);
        assert_eq!(pump.stats().ticks, 2);
    }

    #[test]
    fn generation_change_restarts_on_the_same_tick() {
        let generation = HandlerGeneration::new();
        let (mut pump, coordinator) =
            pump_with(zero_interval_config(), Arc::new(|| true), generation.clone());
        assert!(pump.tick().restart.is_none());

        generation.bump();
        let report = pump.tick();
        assert!(report.version_checked);
        assert_eq!(report.restart, Some(RestartOutcome::Completed { generation: 2 }));
        assert_eq!(coordinator.restarts_completed(), 1);
        assert!(pump.tick().restart.is_none());
    }

    #[test]
    fn version_check_waits_for_its_interval() {
        let config = DispatchConfig {
            version_check_interval: Duration::from_secs(60),
            ..zero_interval_config()
        };
        let (mut pump, _) = pump_with(config, Arc::new(|| true), HandlerGeneration::new());
        assert!(pump.tick().version_checked);
        assert!(!pump.tick().version_checked);
    }

    #[test]
    fn remote_trigger_runs_on_next_tick() {
        let (mut pump, coordinator) =
            pump_with(zero_interval_config(), Arc::new(|| true), HandlerGeneration::new());
        assert!(coordinator.signal().request(RecoveryTrigger::RemoteRequest));
        assert!(matches!(
            pump.tick().restart,
            Some(RestartOutcome::Completed { .. })
        ));
        assert_eq!(pump.stats().restarts_run, 1);
    }

    struct CountedHost {
        remaining: usize,
    }

    impl TickHost for CountedHost {
        fn run(&mut self, tick: &mut dyn FnMut()) {
            while self.remaining > 0 {
                self.remaining -= 1;
                tick();
            }
        }
    }

    #[test]
    fn run_on_ticks_until_the_host_stops() {
        let (mut pump, _) =
            pump_with(zero_interval_config(), Arc::new(|| true), HandlerGeneration::new());
        let mut host = CountedHost { remaining: 4 };
        pump.run_on(&mut host);
        assert_eq!(pump.stats().ticks, 4);
    }
}
