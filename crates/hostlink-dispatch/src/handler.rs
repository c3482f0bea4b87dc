use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;

use crate::command::CommandParams;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("thread affinity violation: {0}")]
    ThreadAffinity(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Business logic behind named actions. Only ever invoked on the main thread.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, action: &str, parameters: &CommandParams) -> Result<Value, HandlerError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&str, &CommandParams) -> Result<Value, HandlerError> + Send + Sync,
{
    fn handle(&self, action: &str, parameters: &CommandParams) -> Result<Value, HandlerError> {
        self(action, parameters)
    }
}

/// Wraps a closure as a shareable handler, fixing its signature for inference.
pub fn handler_fn<F>(handler: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&str, &CommandParams) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// The reloadable code that produces handlers.
///
/// `reload` discards whatever the module cached from its previous build and
/// returns a freshly constructed handler.
pub trait HandlerModule: Send {
    fn name(&self) -> &str;

    fn reload(&mut self) -> Result<Arc<dyn CommandHandler>, HandlerError>;
}

/// Generation counter standing in for a version marker.
///
/// Whoever replaces handler code bumps it; the recovery coordinator compares
/// it against the generation it last restarted on.
#[derive(Clone, Debug, Default)]
pub struct HandlerGeneration(Arc<AtomicU64>);

impl HandlerGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }
}
