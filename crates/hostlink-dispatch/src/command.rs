use std::time::Duration;

use chrono::{DateTime, Utc};
use hostlink_control_client::RemoteCommandResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type CommandParams = Map<String, Value>;

/// A unit of work queued for the main thread. Never mutated after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub id: Uuid,
    pub action: String,
    pub parameters: CommandParams,
    pub enqueued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(action: impl Into<String>, parameters: CommandParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            parameters,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Handler,
    ThreadAffinity,
    Timeout,
    Dispatch,
}

impl FailureKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::ThreadAffinity => "thread_affinity",
            Self::Timeout => "timeout",
            Self::Dispatch => "dispatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

impl CommandResult {
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            failure: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            failure: Some(kind),
        }
    }

    pub fn timed_out(request_id: impl Into<String>, timeout: Duration) -> Self {
        Self::failed(
            request_id,
            FailureKind::Timeout,
            format!("timed out after {timeout:?}"),
        )
    }

    #[must_use]
    pub fn is_thread_affinity_violation(&self) -> bool {
        self.failure == Some(FailureKind::ThreadAffinity)
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

impl From<CommandResult> for RemoteCommandResult {
    fn from(result: CommandResult) -> Self {
        Self {
            request_id: result.request_id,
            success: result.success,
            data: result.data,
            error: result.error,
        }
    }
}
