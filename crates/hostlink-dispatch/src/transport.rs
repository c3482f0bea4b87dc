//! Background poll loop against the remote control plane.
//!
//! The loop owns a [`ConnectionLifecycle`] and publishes clones of its state
//! after every change. Each `connect`/`resume` starts a new session with its
//! own stop flag; `disconnect` only flips that flag, so it is safe to call
//! from the main thread while the old poll thread is blocked on the network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use hostlink_control_client::{
    ACTION_FORCE_RECOVERY, ACTION_RECONNECT, ControlClientError, ControlPlaneClient,
    HeartbeatResponse, PollResponse, RegisterRequest, RemoteCommand, RemoteCommandResult,
    SubmitResultRequest,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::lifecycle::{ConnectionLifecycle, ConnectionState, DisconnectReason, LifecycleConfig};
use crate::queue::CommandQueue;
use crate::recovery::{RecoverySignal, RecoveryTrigger, TransportControl};

const PAUSE_SLICE: Duration = Duration::from_millis(25);
const STOPPED_BEFORE_DISPATCH: &str = "client restarting";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Client(#[from] ControlClientError),
    #[error("control plane rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
}

/// The four calls the poll loop makes against the remote control plane.
pub trait ControlPlane: Send + Sync {
    fn register(&self, client_id: &str, display_name: &str) -> Result<(), TransportError>;

    fn poll(&self, client_id: &str) -> Result<PollResponse, TransportError>;

    fn submit_result(
        &self,
        client_id: &str,
        result: &RemoteCommandResult,
    ) -> Result<(), TransportError>;

    fn heartbeat(&self, client_id: &str) -> Result<HeartbeatResponse, TransportError>;
}

impl ControlPlane for ControlPlaneClient {
    fn register(&self, client_id: &str, display_name: &str) -> Result<(), TransportError> {
        let response = ControlPlaneClient::register(
            self,
            &RegisterRequest {
                client_id: client_id.to_string(),
                display_name: display_name.to_string(),
            },
        )?;
        if response.success {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                operation: "register",
                message: response
                    .message
                    .unwrap_or_else(|| "registration refused".to_string()),
            })
        }
    }

    fn poll(&self, client_id: &str) -> Result<PollResponse, TransportError> {
        Ok(ControlPlaneClient::poll(self, client_id)?)
    }

    fn submit_result(
        &self,
        client_id: &str,
        result: &RemoteCommandResult,
    ) -> Result<(), TransportError> {
        let response = ControlPlaneClient::submit_result(
            self,
            &SubmitResultRequest {
                client_id: client_id.to_string(),
                result: result.clone(),
            },
        )?;
        if response.success {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                operation: "submit_result",
                message: format!("result {} refused", result.request_id),
            })
        }
    }

    fn heartbeat(&self, client_id: &str) -> Result<HeartbeatResponse, TransportError> {
        Ok(ControlPlaneClient::heartbeat(self, client_id)?)
    }
}

/// Every wait the transport performs goes through here.
pub trait Pause: Send + Sync {
    /// Waits up to `duration`, returning early once `stop` is set.
    fn pause(&self, duration: Duration, stop: &AtomicBool);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration, stop: &AtomicBool) {
        let deadline = Instant::now() + duration;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

struct PublishedState {
    session: u64,
    state: ConnectionState,
}

struct TransportShared {
    plane: Arc<dyn ControlPlane>,
    queue: Arc<CommandQueue>,
    signal: Arc<RecoverySignal>,
    config: TransportConfig,
    pause: Arc<dyn Pause>,
    published: Mutex<PublishedState>,
    sessions: AtomicU64,
}

impl TransportShared {
    fn publish(&self, session: u64, state: &ConnectionState) {
        let mut published = self.lock_published();
        if published.session == session {
            published.state = state.clone();
        }
    }

    fn lock_published(&self) -> MutexGuard<'_, PublishedState> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct PollSession {
    id: u64,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct PollingTransport {
    shared: Arc<TransportShared>,
    active: Mutex<Option<PollSession>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingTransport {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        queue: Arc<CommandQueue>,
        signal: Arc<RecoverySignal>,
        config: TransportConfig,
    ) -> Self {
        Self::with_pause(plane, queue, signal, config, Arc::new(ThreadPause))
    }

    pub fn with_pause(
        plane: Arc<dyn ControlPlane>,
        queue: Arc<CommandQueue>,
        signal: Arc<RecoverySignal>,
        config: TransportConfig,
        pause: Arc<dyn Pause>,
    ) -> Self {
        Self {
            shared: Arc::new(TransportShared {
                plane,
                queue,
                signal,
                config,
                pause,
                published: Mutex::new(PublishedState {
                    session: 0,
                    state: ConnectionState::default(),
                }),
                sessions: AtomicU64::new(0),
            }),
            active: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Registers synchronously, then starts the poll thread. Returns false if
    /// registration failed; no thread is started in that case.
    pub fn connect(&self) -> bool {
        if self.is_running() {
            debug!("poll loop already running; connect is a no-op");
            return true;
        }
        let mut worker = self.new_worker();
        worker.lifecycle.mark_registering();
        worker.publish();
        match worker.register() {
            Ok(()) => {
                worker.lifecycle.mark_live();
                worker.publish();
                info!(
                    client_id = %self.shared.config.client_id,
                    base_url = %self.shared.config.base_url,
                    "registered with control plane"
                );
                self.spawn(worker, true)
            }
            Err(register_error) => {
                warn!(error = %register_error, "control plane registration failed");
                let _ = worker.lifecycle.mark_disconnect(
                    DisconnectReason::RegistrationFailed,
                    Some(register_error.to_string()),
                );
                worker.lifecycle.mark_stopped();
                worker.publish();
                false
            }
        }
    }

    /// Starts a poll thread that registers in the background.
    pub fn resume(&self) {
        if self.is_running() {
            debug!("poll loop already running; resume is a no-op");
            return;
        }
        let worker = self.new_worker();
        if self.spawn(worker, false) {
            info!("poll loop resuming");
        }
    }

    /// Signals the active poll thread to stop without waiting for it.
    pub fn disconnect(&self) {
        let session = self.lock_active().take();
        let Some(session) = session else {
            return;
        };
        session.stop.store(true, Ordering::SeqCst);
        info!(session = session.id, "poll loop stop requested");
        let mut retired = self.lock_retired();
        retired.retain(|handle| !handle.is_finished());
        retired.push(session.handle);
    }

    /// Stops polling and joins every poll thread this transport started.
    pub fn shutdown(&self) {
        self.disconnect();
        let handles = std::mem::take(&mut *self.lock_retired());
        for handle in handles {
            if handle.join().is_err() {
                error!("poll thread panicked before shutdown");
            }
        }
        info!("transport shut down");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock_published().state.clone()
    }

    /// Submits one result, retrying with a fixed delay. Returns false once retries are exhausted.
    pub fn send_message(&self, result: &RemoteCommandResult) -> bool {
        submit_with_retries(&self.shared, result, &AtomicBool::new(false))
    }

    fn new_worker(&self) -> PollWorker {
        let session = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let lifecycle = ConnectionLifecycle::new(LifecycleConfig::from(&self.shared.config));
        {
            let mut published = self.shared.lock_published();
            published.session = session;
            published.state = lifecycle.snapshot();
        }
        PollWorker {
            shared: Arc::clone(&self.shared),
            session,
            stop: Arc::new(AtomicBool::new(false)),
            lifecycle,
            last_heartbeat: None,
            reconnect_requested: false,
        }
    }

    fn spawn(&self, worker: PollWorker, registered: bool) -> bool {
        let id = worker.session;
        let stop = Arc::clone(&worker.stop);
        match thread::Builder::new()
            .name(format!("hostlink-poll-{id}"))
            .spawn(move || worker.run(registered))
        {
            Ok(handle) => {
                *self.lock_active() = Some(PollSession { id, stop, handle });
                true
            }
            Err(spawn_error) => {
                error!(error = %spawn_error, "failed to spawn poll thread");
                false
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<PollSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retired(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportControl for PollingTransport {
    fn disconnect(&self) {
        PollingTransport::disconnect(self);
    }

    fn resume(&self) {
        PollingTransport::resume(self);
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(session) = self.lock_active().as_ref() {
            session.stop.store(true, Ordering::SeqCst);
        }
    }
}

struct PollWorker {
    shared: Arc<TransportShared>,
    session: u64,
    stop: Arc<AtomicBool>,
    lifecycle: ConnectionLifecycle,
    last_heartbeat: Option<Instant>,
    reconnect_requested: bool,
}

impl PollWorker {
    fn run(mut self, registered: bool) {
        info!(session = self.session, "poll loop started");
        if registered || self.reregister_now(DisconnectReason::Recovery) {
            while !self.stopped() {
                self.iterate();
                if self.stopped() {
                    break;
                }
                self.shared
                    .pause
                    .pause(self.shared.config.poll_interval, &self.stop);
            }
        }
        self.lifecycle.mark_stopped();
        self.publish();
        info!(session = self.session, "poll loop stopped");
    }

    fn iterate(&mut self) {
        self.heartbeat_if_due();

        match self.shared.plane.poll(&self.shared.config.client_id) {
            Ok(response) if !response.registered => {
                warn!("control plane no longer recognises this client");
                self.reregister_now(DisconnectReason::Unregistered);
            }
            Ok(response) => {
                self.lifecycle.record_poll_success();
                self.publish();
                self.process_commands(response.commands);
            }
            Err(poll_error) => {
                let message = poll_error.to_string();
                debug!(error = %message, "poll failed");
                if self.lifecycle.record_poll_failure(message.clone()) {
                    self.reconnect(DisconnectReason::PollFailures, Some(message));
                } else {
                    self.publish();
                }
            }
        }

        if self.reconnect_requested && !self.stopped() {
            self.reconnect_requested = false;
            self.reregister_now(DisconnectReason::RemoteRequest);
        }
    }

    /// Answers every polled command. The plane has already handed them out, so
    /// commands left over after a stop are failed rather than dropped.
    fn process_commands(&mut self, commands: Vec<RemoteCommand>) {
        for command in commands {
            let result = if self.stopped() {
                debug!(request_id = %command.request_id, "poll loop stopping; failing command");
                RemoteCommandResult {
                    request_id: command.request_id,
                    success: false,
                    data: None,
                    error: Some(STOPPED_BEFORE_DISPATCH.to_string()),
                }
            } else {
                self.dispatch(command)
            };
            if !submit_with_retries(&self.shared, &result, &self.stop) {
                warn!(request_id = %result.request_id, "result dropped after retries");
            }
        }
    }

    fn dispatch(&mut self, command: RemoteCommand) -> RemoteCommandResult {
        let control = command.is_control();
        let RemoteCommand {
            request_id,
            action,
            params,
        } = command;
        debug!(%request_id, %action, control, "command received");
        match action.as_str() {
            ACTION_FORCE_RECOVERY => {
                let scheduled = self.shared.signal.request(RecoveryTrigger::RemoteRequest);
                control_ack(
                    request_id,
                    json!({ "recovery": if scheduled { "scheduled" } else { "already_pending" } }),
                )
            }
            ACTION_RECONNECT => {
                self.reconnect_requested = true;
                control_ack(request_id, json!({ "reconnect": "scheduled" }))
            }
            _ => self
                .shared
                .queue
                .enqueue_and_wait(action, params, self.shared.config.command_timeout)
                .with_request_id(request_id)
                .into(),
        }
    }

    fn heartbeat_if_due(&mut self) {
        let interval = self.shared.config.heartbeat_interval;
        if self
            .last_heartbeat
            .is_some_and(|sent_at| sent_at.elapsed() < interval)
        {
            return;
        }
        self.last_heartbeat = Some(Instant::now());
        match self.shared.plane.heartbeat(&self.shared.config.client_id) {
            Ok(response) => {
                if !response.success {
                    debug!(status = ?response.status, "heartbeat not acknowledged");
                }
                self.lifecycle.record_heartbeat(Utc::now());
                self.publish();
            }
            Err(heartbeat_error) => debug!(error = %heartbeat_error, "heartbeat failed"),
        }
    }

    /// Registers right away, falling back to the backoff loop on failure.
    fn reregister_now(&mut self, reason: DisconnectReason) -> bool {
        info!(reason = reason.as_str(), "re-registering with control plane");
        self.lifecycle.mark_registering();
        self.publish();
        match self.register() {
            Ok(()) => {
                self.lifecycle.mark_live();
                self.publish();
                true
            }
            Err(register_error) => self.reconnect(
                DisconnectReason::RegistrationFailed,
                Some(register_error.to_string()),
            ),
        }
    }

    /// Backs off and re-registers until it succeeds or the session is stopped.
    fn reconnect(&mut self, mut reason: DisconnectReason, mut error: Option<String>) -> bool {
        loop {
            let delay = self.lifecycle.mark_disconnect(reason, error.take());
            self.publish();
            warn!(
                reason = reason.as_str(),
                attempt = self.lifecycle.state().reconnect_attempts,
                delay_ms = delay.as_millis(),
                "control plane connection lost; reconnecting"
            );
            self.shared.pause.pause(delay, &self.stop);
            if self.stopped() {
                return false;
            }
            self.lifecycle.mark_registering();
            self.publish();
            match self.register() {
                Ok(()) => {
                    self.lifecycle.mark_live();
                    self.publish();
                    info!("reconnected to control plane");
                    return true;
                }
                Err(register_error) => {
                    reason = DisconnectReason::RegistrationFailed;
                    error = Some(register_error.to_string());
                }
            }
        }
    }

    fn register(&self) -> Result<(), TransportError> {
        self.shared.plane.register(
            &self.shared.config.client_id,
            &self.shared.config.display_name,
        )
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn publish(&self) {
        self.shared.publish(self.session, self.lifecycle.state());
    }
}

fn control_ack(request_id: String, data: serde_json::Value) -> RemoteCommandResult {
    RemoteCommandResult {
        request_id,
        success: true,
        data: Some(data),
        error: None,
    }
}

fn submit_with_retries(
    shared: &TransportShared,
    result: &RemoteCommandResult,
    stop: &AtomicBool,
) -> bool {
    let attempts = shared.config.submit_attempts.max(1);
    for attempt in 1..=attempts {
        match shared
            .plane
            .submit_result(&shared.config.client_id, result)
        {
            Ok(()) => return true,
            Err(submit_error) => {
                warn!(
                    request_id = %result.request_id,
                    attempt,
                    attempts,
                    error = %submit_error,
                    "result submission failed"
                );
                if attempt < attempts {
                    shared.pause.pause(shared.config.submit_retry_delay, stop);
                }
            }
        }
    }
    false
}
