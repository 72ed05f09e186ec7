use std::fmt;

use thiserror::Error;

/// Known failure kinds of a call against a source replica.
///
/// Handlers classify by kind instead of by runtime type, see [`crate::retry::ExceptionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The channel failed mid-call (reset, broken pipe, truncated body)
    Transport,
    Timeout,
    /// The replica is alive but asked us to back off
    ServiceBusy,
    /// The resolved replica is no longer the primary
    NotPrimary,
    /// Nothing is listening at the resolved address, or the partition has no suitable replica
    EndpointNotFound,
    ConnectionRefused,
    /// The replica answered with a payload we cannot decode
    InvalidResponse,
    /// The replica reported a failure of the operation itself
    Server,
    Unknown,
}

impl RemoteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ServiceBusy => "service_busy",
            Self::NotPrimary => "not_primary",
            Self::EndpointNotFound => "endpoint_not_found",
            Self::ConnectionRefused => "connection_refused",
            Self::InvalidResponse => "invalid_response",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("remote call failed: {0}")]
    Remote(RemoteError),
    #[error("remote call failed after {retries} retries across {error_ids:?}, last error: {last}")]
    Aggregate {
        last: RemoteError,
        error_ids: Vec<String>,
        retries: u32,
    },
    #[error("remote call cancelled")]
    Cancelled,
}

impl ClientError {
    /// The last remote failure observed, if the call failed remotely.
    pub fn last_remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(error) | Self::Aggregate { last: error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}
