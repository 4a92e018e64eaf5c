use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a ticket was turned away by the admission controller.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("request waited {waited_ms}ms in the admission queue and timed out")]
    QueueTimeout { waited_ms: u64 },
    #[error("admission queue is full ({queue_length} waiting)")]
    Overloaded { queue_length: usize },
    #[error("gateway is draining and no longer admits requests")]
    Draining,
}

/// Failure reported by an origin fetcher. Passed through to every waiter unchanged.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error(
    "origin failure{}: {message}",
    .status.map(|code| format!(" ({code})")).unwrap_or_default()
)]
pub struct OriginError {
    pub status: Option<u16>,
    pub message: String,
}

impl OriginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }

    /// Transport failures and 5xx answers; client errors such as 404 are not faults.
    pub fn is_server_fault(&self) -> bool {
        self.status.map_or(true, |status| status >= 500)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("could not estimate size of cache entry `{key}`: {message}")]
    Serialize { key: String, message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartSuppressed {
    #[error("restart suppressed by cooldown ({remaining_ms}ms remaining)")]
    Cooldown { remaining_ms: u64 },
    #[error("restart budget of {max_restarts} exhausted; automatic restarts disabled")]
    BudgetExhausted { max_restarts: u32 },
    #[error("a restart is already in progress")]
    InProgress,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error(transparent)]
    Rejected(#[from] RejectReason),
    #[error("response of {size} bytes exceeds limit of {limit} bytes")]
    ResponseTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, retry_after_secs: u64, correlation_id: String },
    #[error("payload too large: {message}")]
    PayloadTooLarge { message: String, limit: usize, correlation_id: String },
    #[error("upstream error: {message}")]
    Upstream { status: u16, message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ServiceUnavailable { .. } => 503,
            Self::PayloadTooLarge { .. } => 413,
            Self::Upstream { status, .. } => *status,
            Self::Internal { .. } => 500,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ServiceUnavailable { retry_after_secs, .. } => format!(
                "The service is temporarily overloaded. Please retry in {retry_after_secs} seconds."
            ),
            Self::PayloadTooLarge { limit, .. } => {
                format!("Response too large. The configured limit is {limit} bytes.")
            }
            Self::Upstream { message, .. } => message.clone(),
            Self::Internal { .. } => "An unexpected internal error occurred.".to_string(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::ServiceUnavailable { correlation_id, .. }
            | Self::PayloadTooLarge { correlation_id, .. }
            | Self::Upstream { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl GatewayError {
    /// Maps the error to its client-facing form. `queue_timeout` feeds the retry hint.
    pub fn into_interface(
        self,
        correlation_id: impl Into<String>,
        queue_timeout: Duration,
    ) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let retry_after_secs = queue_timeout.as_secs().max(1);
        match self {
            Self::Rejected(reason) => InterfaceError::ServiceUnavailable {
                message: reason.to_string(),
                retry_after_secs,
                correlation_id,
            },
            Self::ResponseTooLarge { size, limit } => InterfaceError::PayloadTooLarge {
                message: format!("response of {size} bytes exceeds limit of {limit} bytes"),
                limit,
                correlation_id,
            },
            Self::Origin(OriginError { status, message }) => InterfaceError::Upstream {
                status: status.filter(|code| (400..600).contains(code)).unwrap_or(502),
                message,
                correlation_id,
            },
            Self::Cache(error) => {
                InterfaceError::Internal { message: error.to_string(), correlation_id }
            }
        }
    }
}
