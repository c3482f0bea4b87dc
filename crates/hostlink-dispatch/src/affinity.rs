use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// Answers whether the calling thread is the host's designated main thread.
pub trait MainThreadProbe: Send + Sync {
    fn is_main_thread(&self) -> bool;
}

impl<F> MainThreadProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_main_thread(&self) -> bool {
        self()
    }
}

/// Probe bound explicitly by the host from inside its main loop.
///
/// Until `bind_current` has been called no thread counts as the main thread,
/// so an unbound dispatcher refuses to drain instead of guessing.
#[derive(Debug, Default)]
pub struct DesignatedThread {
    bound: Mutex<Option<ThreadId>>,
}

impl DesignatedThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_current(&self) {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        *bound = Some(thread::current().id());
    }

    pub fn unbind(&self) {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        *bound = None;
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl MainThreadProbe for DesignatedThread {
    fn is_main_thread(&self) -> bool {
        let bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        *bound == Some(thread::current().id())
    }
}

const AFFINITY_PATTERNS: [&str; 8] = [
    "main thread only",
    "only be called from the main thread",
    "must be called from the main thread",
    "must be called on the main thread",
    "not on the main thread",
    "not called from main thread",
    "called from a background thread",
    "wrong thread",
];

/// Text fallback for handler errors that carry no structured affinity signal.
#[must_use]
pub fn looks_like_affinity_violation(error: &str) -> bool {
    let normalized = error.to_ascii_lowercase();
    AFFINITY_PATTERNS
        .iter()
        .any(|pattern| normalized.contains(pattern))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DesignatedThread, MainThreadProbe, looks_like_affinity_violation};

    #[test]
    fn designated_thread_matches_only_the_bound_thread() {
        let probe = Arc::new(DesignatedThread::new());
        assert!(!probe.is_main_thread());

        probe.bind_current();
        assert!(probe.is_bound());
        assert!(probe.is_main_thread());

        let remote = Arc::clone(&probe);
        let off_thread = std::thread::spawn(move || remote.is_main_thread())
            .join()
            .expect("probe thread");
        assert!(!off_thread);

        probe.unbind();
        assert!(!probe.is_main_thread());
    }

    #[test]
    fn closures_act_as_probes() {
        let always = || true;
        assert!(always.is_main_thread());
    }

    #[test]
    fn classifier_matches_known_host_messages() {
        assert!(looks_like_affinity_violation(
            "RuntimeError: this API can only be called from the main thread"
        ));
        assert!(looks_like_affinity_violation(
            "Scene mutation attempted NOT on the main thread"
        ));
        assert!(looks_like_affinity_violation("called from a background thread"));
        assert!(!looks_like_affinity_violation("file not found: scene.blend"));
        assert!(!looks_like_affinity_violation(""));
    }
}
