use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error surface for the daemon pipeline.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync error: {0}")]
    Sync(#[from] keymirror_sync::SyncError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("notification command error: {0}")]
    Hook(#[from] HookError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{0}")]
    Join(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Failures talking to the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store request failed: {0}")]
    Request(String),

    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error("failed to read credential {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch terminated: {0}")]
    Watch(String),
}

impl StoreError {
    /// Transient: the request may succeed if retried.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match &err {
            etcd_client::Error::GRpcStatus(status) if status.code() == tonic::Code::Unavailable => {
                StoreError::Unavailable(status.message().to_string())
            }
            etcd_client::Error::TransportError(_) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Request(err.to_string()),
        }
    }
}

/// Failures delivering a diff to a notification receiver.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notification endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("TLS setup for {endpoint} failed: {reason}")]
    Tls { endpoint: String, reason: String },

    #[error("failed to read credential {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("{endpoint} rejected the diff: {status}")]
    Status {
        endpoint: String,
        status: tonic::Status,
    },

    #[error("failed to close connection to {endpoint}: {reason}")]
    Close { endpoint: String, reason: String },
}

/// Failures running the post-apply notification command.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("notification command is empty")]
    Empty,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}
