#![cfg_attr(test, allow(clippy::expect_used))]

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 1;

/// Control instruction asking the client to run a full recovery restart.
pub const ACTION_FORCE_RECOVERY: &str = "force_recovery";
/// Control instruction asking the client to drop and re-register its session.
pub const ACTION_RECONNECT: &str = "reconnect";

#[derive(Debug, Clone)]
pub struct ControlPlaneClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl ControlPlaneClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Error)]
pub enum ControlClientError {
    #[error("control_client_base_url_missing")]
    BaseUrlMissing,
    #[error("control_client_invalid_path")]
    InvalidPath,
    #[error("control_request_failed:{message}")]
    Request { message: String },
    #[error("control_read_failed:{message}")]
    Read { message: String },
    #[error("control_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("control_json_decode_failed:{message}")]
    Decode { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub client_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollResponse {
    #[serde(default = "default_registered")]
    pub registered: bool,
    #[serde(default)]
    pub commands: Vec<RemoteCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCommand {
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl RemoteCommand {
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.action == ACTION_FORCE_RECOVERY || self.action == ACTION_RECONNECT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCommandResult {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResultRequest {
    pub client_id: String,
    pub result: RemoteCommandResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResultResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_registered() -> bool {
    true
}

impl ControlPlaneClient {
    pub fn new(config: ControlPlaneClientConfig) -> Result<Self, ControlClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::blocking::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn register_path() -> &'static str {
        "/api/v1/clients/register"
    }

    #[must_use]
    pub fn poll_path() -> &'static str {
        "/api/v1/clients/poll"
    }

    #[must_use]
    pub fn result_path() -> &'static str {
        "/api/v1/clients/result"
    }

    #[must_use]
    pub fn heartbeat_path() -> &'static str {
        "/api/v1/clients/heartbeat"
    }

    pub fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, ControlClientError> {
        self.post_json(Self::register_path(), request)
    }

    pub fn poll(&self, client_id: &str) -> Result<PollResponse, ControlClientError> {
        self.post_json(
            Self::poll_path(),
            &ClientRequest {
                client_id: client_id.to_string(),
            },
        )
    }

    pub fn submit_result(
        &self,
        request: &SubmitResultRequest,
    ) -> Result<SubmitResultResponse, ControlClientError> {
        self.post_json(Self::result_path(), request)
    }

    pub fn heartbeat(&self, client_id: &str) -> Result<HeartbeatResponse, ControlClientError> {
        self.post_json(
            Self::heartbeat_path(),
            &ClientRequest {
                client_id: client_id.to_string(),
            },
        )
    }

    pub fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ControlClientError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(ControlClientError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .http
                .post(url.as_str())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout)
                .json(payload);

            match request.send() {
                Ok(response) => return decode_json_response(response),
                Err(error) => {
                    tracing::debug!(%url, attempt, %error, "control plane request failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(ControlClientError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ControlClientError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    ControlClientError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, ControlClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ControlClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn decode_json_response<T>(response: reqwest::blocking::Response) -> Result<T, ControlClientError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response.bytes().map_err(|error| ControlClientError::Read {
        message: error.to_string(),
    })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| ControlClientError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
