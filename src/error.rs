//! Error types for the session orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the container runtime facade.
///
/// Variants carry a `reason` string instead of the underlying client error so
/// that alternative runtime implementations (including test mocks) can
/// construct them without depending on bollard.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to the container runtime: {reason}")]
    Connect { reason: String },

    #[error("failed to create network {name}: {reason}")]
    NetworkCreate { name: String, reason: String },

    #[error("failed to run container {name}: {reason}")]
    Run { name: String, reason: String },

    #[error("exec in container {container_id} failed: {reason}")]
    Exec {
        container_id: String,
        reason: String,
    },

    #[error("exec in container {container_id} timed out after {timeout:?}")]
    ExecTimeout {
        container_id: String,
        timeout: Duration,
    },

    #[error("failed to stop container {container_id}: {reason}")]
    Stop {
        container_id: String,
        reason: String,
    },

    #[error("failed to remove network {network_id}: {reason}")]
    NetworkRemove {
        network_id: String,
        reason: String,
    },

    #[error("image build for tag {tag} failed: {reason}")]
    ImageBuild { tag: String, reason: String },
}

/// Errors raised while provisioning a single session.
///
/// These are absorbed by the creator daemon: the failure is logged, the
/// partially provisioned session (if any) is left behind, and the daemon
/// retries with backoff.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not generate random credentials: {reason}")]
    Credentials { reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Client-observable outcomes of a session request.
///
/// `TooSoon` maps to 429 Too Many Requests at the HTTP boundary; every other
/// variant maps to 500 Internal Server Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("not enough time has passed since the last request")]
    TooSoon,

    #[error("no more sessions are currently available")]
    NoSessionsAvailable,

    #[error("the session manager did not respond in time")]
    Timeout,

    #[error("the session manager is no longer accepting requests")]
    Closed,
}

/// Fatal startup errors. Raised only before the daemons are launched.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("failed to prepare the proxy state directory {path}: {source}")]
    PiperFilesystem {
        path: String,
        source: std::io::Error,
    },
}
