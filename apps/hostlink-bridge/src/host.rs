use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hostlink_dispatch::TickHost;

/// Stand-in for a host application's main loop: ticks at a fixed rate until
/// the stop flag is raised or the optional deadline passes.
pub struct FixedRateHost {
    interval: Duration,
    stop: Arc<AtomicBool>,
    deadline: Option<Instant>,
    ticks: u64,
}

impl FixedRateHost {
    pub fn new(interval: Duration, stop: Arc<AtomicBool>, run_for: Option<Duration>) -> Self {
        Self {
            interval,
            stop,
            deadline: run_for.map(|run_for| Instant::now() + run_for),
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl TickHost for FixedRateHost {
    fn run(&mut self, tick: &mut dyn FnMut()) {
        let mut next = Instant::now();
        while !self.should_stop() {
            tick();
            self.ticks = self.ticks.saturating_add(1);
            next += self.interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
    }
}
