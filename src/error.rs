//! Uniform error taxonomy (spec §7). Every fallible operation in this crate
//! returns `HubError`; the dispatcher is the only place that flattens it
//! into the wire-level JSON envelope.

use serde::Serialize;
use thiserror::Error;

use crate::model::HostKey;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("authentication failed for {host}: {message}")]
    AuthFailure { host: HostKey, message: String },

    #[error("connect error for {host}: {message}")]
    Connect { host: HostKey, message: String },

    #[error("execution error: {message}")]
    Execution { message: String, exit_code: Option<i32> },

    #[error("command blocked: {reason}")]
    SafetyBlocked { reason: String },

    #[error("transfer error: {message}")]
    Transfer { message: String },

    #[error("operation timed out: {message}")]
    TimedOut { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("pool is shutting down")]
    PoolShuttingDown,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] async_ssh2_tokio::Error),

    #[error(transparent)]
    Russh(#[from] russh::Error),

    #[error(transparent)]
    Sftp(#[from] russh_sftp::client::error::Error),
}

/// Wire-level discriminant. `CacheMiss` is internal only and never crosses
/// the dispatcher boundary (a miss is not an error, it's a fallthrough to
/// execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    AuthFailure,
    ConnectError,
    ExecutionError,
    SafetyBlocked,
    TransferError,
    TimedOut,
    Cancelled,
    PoolShuttingDown,
    SessionNotFound,
    SessionBusy,
    Internal,
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Config { .. } => ErrorKind::ConfigError,
            HubError::AuthFailure { .. } => ErrorKind::AuthFailure,
            HubError::Connect { .. } => ErrorKind::ConnectError,
            HubError::Execution { .. } => ErrorKind::ExecutionError,
            HubError::SafetyBlocked { .. } => ErrorKind::SafetyBlocked,
            HubError::Transfer { .. } => ErrorKind::TransferError,
            HubError::TimedOut { .. } => ErrorKind::TimedOut,
            HubError::Cancelled => ErrorKind::Cancelled,
            HubError::PoolShuttingDown => ErrorKind::PoolShuttingDown,
            HubError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            HubError::SessionBusy(_) => ErrorKind::SessionBusy,
            HubError::Io(_) | HubError::Ssh(_) | HubError::Russh(_) | HubError::Sftp(_) => {
                ErrorKind::ConnectError
            }
        }
    }

    pub fn host(&self) -> Option<&HostKey> {
        match self {
            HubError::AuthFailure { host, .. } | HubError::Connect { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        HubError::Config { message: message.into() }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        HubError::Transfer { message: message.into() }
    }

    pub fn execution(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        HubError::Execution { message: message.into(), exit_code }
    }

    /// Clones the minimum needed to broadcast an identical outcome to every
    /// waiter coalesced behind a single connect attempt (spec §9); library
    /// source errors collapse to their display string since the underlying
    /// error types aren't `Clone`.
    pub fn shallow_clone(&self) -> Self {
        match self {
            HubError::Config { message } => HubError::Config { message: message.clone() },
            HubError::AuthFailure { host, message } => {
                HubError::AuthFailure { host: host.clone(), message: message.clone() }
            }
            HubError::Connect { host, message } => {
                HubError::Connect { host: host.clone(), message: message.clone() }
            }
            HubError::Execution { message, exit_code } => {
                HubError::Execution { message: message.clone(), exit_code: *exit_code }
            }
            HubError::SafetyBlocked { reason } => HubError::SafetyBlocked { reason: reason.clone() },
            HubError::Transfer { message } => HubError::Transfer { message: message.clone() },
            HubError::TimedOut { message } => HubError::TimedOut { message: message.clone() },
            HubError::Cancelled => HubError::Cancelled,
            HubError::PoolShuttingDown => HubError::PoolShuttingDown,
            HubError::SessionNotFound(id) => HubError::SessionNotFound(id.clone()),
            HubError::SessionBusy(id) => HubError::SessionBusy(id.clone()),
            other => HubError::Connect { host: HostKey::new("", 0, ""), message: other.to_string() },
        }
    }
}

/// The envelope serialized into `response.error` (spec §6/§7).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl From<&HubError> for ErrorEnvelope {
    fn from(err: &HubError) -> Self {
        ErrorEnvelope {
            kind: err.kind(),
            message: err.to_string(),
            host: err.host().map(|h| h.to_string()),
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;
