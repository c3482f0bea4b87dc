#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

//! Cross-thread command dispatch for hosts whose API only works on one
//! designated main thread.
//!
//! Background threads hand work to the main thread through [`CommandQueue`];
//! the host calls [`DispatchPump::tick`] from its own loop; a
//! [`PollingTransport`] feeds the queue from a remote control plane; and a
//! [`RecoveryCoordinator`] rebuilds handler bindings when they go stale.

pub mod affinity;
pub mod command;
pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod pump;
pub mod queue;
pub mod recovery;
pub mod transport;

pub use affinity::{DesignatedThread, MainThreadProbe, looks_like_affinity_violation};
pub use command::{Command, CommandParams, CommandResult, FailureKind};
pub use config::{ConfigError, DispatchConfig, MIN_RECONNECT_DELAY, TransportConfig};
pub use handler::{CommandHandler, HandlerError, HandlerGeneration, HandlerModule, handler_fn};
pub use lifecycle::{ConnectionPhase, ConnectionState, DisconnectReason};
pub use pump::{DispatchPump, PumpStats, TickHost, TickReport};
pub use queue::{ClearOutcome, CommandQueue, QueueStats, ViolationSink, null_handler};
pub use recovery::{
    RecoveryCoordinator, RecoveryPhase, RecoverySignal, RecoveryTrigger, RestartOutcome,
    TransportControl,
};
pub use transport::{ControlPlane, Pause, PollingTransport, ThreadPause, TransportError};
