use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{MIN_RECONNECT_DELAY, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Registering,
    Live,
    Backoff,
    Stopped,
}

impl ConnectionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Registering => "registering",
            Self::Live => "live",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PollFailures,
    Unregistered,
    RegistrationFailed,
    RemoteRequest,
    Recovery,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PollFailures => "poll_failures",
            Self::Unregistered => "unregistered",
            Self::RegistrationFailed => "registration_failed",
            Self::RemoteRequest => "remote_request",
            Self::Recovery => "recovery",
        }
    }
}

/// Connection bookkeeping of the poll thread. Readers elsewhere only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            connected: false,
            consecutive_failures: 0,
            last_heartbeat_at: None,
            reconnect_delay: MIN_RECONNECT_DELAY,
            reconnect_attempts: 0,
            last_disconnect_reason: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for LifecycleConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionLifecycle {
    config: LifecycleConfig,
    state: ConnectionState,
    backoff_step: u32,
}

impl ConnectionLifecycle {
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        let state = ConnectionState {
            reconnect_delay: config.reconnect_base.max(MIN_RECONNECT_DELAY),
            ..ConnectionState::default()
        };
        Self {
            config,
            state,
            backoff_step: 0,
        }
    }

    pub fn mark_registering(&mut self) {
        self.state.phase = ConnectionPhase::Registering;
    }

    pub fn mark_live(&mut self) {
        self.state.phase = ConnectionPhase::Live;
        self.state.connected = true;
        self.state.consecutive_failures = 0;
        self.state.last_error = None;
        self.backoff_step = 0;
        self.state.reconnect_delay = self.backoff_delay();
    }

    pub fn record_poll_success(&mut self) {
        self.state.consecutive_failures = 0;
    }

    /// Counts a failed poll; returns true once the run of failures calls for a reconnect.
    #[must_use]
    pub fn record_poll_failure(&mut self, error: impl Into<String>) -> bool {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_error = Some(error.into());
        self.state.consecutive_failures >= self.config.max_consecutive_failures.max(1)
    }

    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.state.last_heartbeat_at = Some(at);
    }

    /// Marks the session down and returns how long to wait before re-registering.
    #[must_use]
    pub fn mark_disconnect(&mut self, reason: DisconnectReason, error: Option<String>) -> Duration {
        let delay = self.backoff_delay();
        self.state.phase = ConnectionPhase::Backoff;
        self.state.connected = false;
        self.state.reconnect_attempts = self.state.reconnect_attempts.saturating_add(1);
        self.state.last_disconnect_reason = Some(reason);
        if error.is_some() {
            self.state.last_error = error;
        }
        self.state.reconnect_delay = delay;
        self.backoff_step = self.backoff_step.saturating_add(1);
        delay
    }

    pub fn mark_stopped(&mut self) {
        self.state.phase = ConnectionPhase::Stopped;
        self.state.connected = false;
    }

    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.state.clone()
    }

    fn backoff_delay(&self) -> Duration {
        let base = self.config.reconnect_base.max(MIN_RECONNECT_DELAY);
        let exponent = self.backoff_step.min(10);
        let scaled = base.saturating_mul(1_u32 << exponent);
        scaled.min(self.config.reconnect_max.max(base))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{
        ConnectionLifecycle, ConnectionPhase, DisconnectReason, LifecycleConfig,
    };

    fn lifecycle() -> ConnectionLifecycle {
        ConnectionLifecycle::new(LifecycleConfig {
            reconnect_base: Duration::from_secs(3),
            reconnect_max: Duration::from_secs(20),
            max_consecutive_failures: 3,
        })
    }

    #[test]
    fn reconnect_backoff_grows_and_caps_across_disconnects() {
        let mut lifecycle = lifecycle();
        lifecycle.mark_registering();
        lifecycle.mark_live();

        let first = lifecycle.mark_disconnect(DisconnectReason::PollFailures, None);
        assert_eq!(first, Duration::from_secs(3));
        let second = lifecycle.mark_disconnect(DisconnectReason::RegistrationFailed, None);
        assert_eq!(second, Duration::from_secs(6));

        for _ in 0..16 {
            let _ = lifecycle.mark_disconnect(DisconnectReason::RegistrationFailed, None);
        }
        let capped = lifecycle.mark_disconnect(DisconnectReason::RegistrationFailed, None);
        assert_eq!(capped, Duration::from_secs(20));

        lifecycle.mark_live();
        let reset = lifecycle.mark_disconnect(DisconnectReason::Unregistered, None);
        assert_eq!(reset, Duration::from_secs(3));
    }

    #[test]
    fn backoff_never_retries_faster_than_the_floor() {
        let mut lifecycle = ConnectionLifecycle::new(LifecycleConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(10),
            max_consecutive_failures: 1,
        });
        let delay = lifecycle.mark_disconnect(DisconnectReason::PollFailures, None);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn failure_run_reaches_threshold_and_success_resets_it() {
        let mut lifecycle = lifecycle();
        lifecycle.mark_live();
        assert!(!lifecycle.record_poll_failure("connection refused"));
        assert!(!lifecycle.record_poll_failure("connection refused"));
        assert!(lifecycle.record_poll_failure("connection refused"));
        assert_eq!(lifecycle.state().consecutive_failures, 3);
        assert_eq!(
            lifecycle.state().last_error.as_deref(),
            Some("connection refused")
        );

        lifecycle.record_poll_success();
        assert_eq!(lifecycle.state().consecutive_failures, 0);
    }

    #[test]
    fn lifecycle_tracks_phase_and_heartbeat() {
        let mut lifecycle = lifecycle();
        assert_eq!(lifecycle.state().phase, ConnectionPhase::Idle);

        lifecycle.mark_registering();
        assert_eq!(lifecycle.state().phase, ConnectionPhase::Registering);
        assert!(!lifecycle.state().connected);

        lifecycle.mark_live();
        let now = Utc::now();
        lifecycle.record_heartbeat(now);
        let snapshot = lifecycle.snapshot();
        assert_eq!(snapshot.phase, ConnectionPhase::Live);
        assert!(snapshot.connected);
        assert_eq!(snapshot.last_heartbeat_at, Some(now));

        let _ = lifecycle.mark_disconnect(
            DisconnectReason::RemoteRequest,
            Some("plane asked for reconnect".to_string()),
        );
        let snapshot = lifecycle.snapshot();
        assert_eq!(snapshot.phase, ConnectionPhase::Backoff);
        assert!(!snapshot.connected);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(
            snapshot.last_disconnect_reason,
            Some(DisconnectReason::RemoteRequest)
        );

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state().phase.as_str(), "stopped");
    }
}
