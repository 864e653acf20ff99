//! Session lifecycle core.
//!
//! Three cooperating daemons connected by bounded FIFO channels:
//!
//! ```text
//! creator ──▶ warm pool ──▶ dispatcher ──▶ active set ──▶ reaper
//!                               ▲
//!                        client requests
//! ```
//!
//! A single watch-based shutdown broadcast fans out to all three daemons;
//! each acknowledges by returning from its run loop so the shutdown
//! coordinator can proceed to drain whatever is left in the channels.

pub mod creator;
pub mod dispatcher;
pub mod reaper;
pub mod shutdown;

pub use creator::Creator;
pub use dispatcher::Dispatcher;
pub use reaper::Reaper;

use std::net::IpAddr;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::RequestError;
use crate::session::Session;

/// One client's request for a session.
///
/// The response channel is owned by the requester and receives exactly one
/// response; the requester awaits it under its own deadline.
#[derive(Debug)]
pub struct ClientRequest {
    /// Address of the client making the request, used for throttling.
    pub client_ip: IpAddr,
    /// Where the dispatcher sends the outcome.
    pub respond_to: oneshot::Sender<Result<Session, RequestError>>,
}

/// All channels connecting the daemons and the HTTP ingress.
pub struct SessionChannels {
    /// Creator-side of the warm pool.
    pub warm_tx: mpsc::Sender<Session>,
    /// Dispatcher-side of the warm pool.
    pub warm_rx: mpsc::Receiver<Session>,
    /// Ingress-side of the request channel, cloned into HTTP handlers.
    pub request_tx: mpsc::Sender<ClientRequest>,
    /// Dispatcher-side of the request channel.
    pub request_rx: mpsc::Receiver<ClientRequest>,
    /// Dispatcher-side of the active set.
    pub active_tx: mpsc::Sender<Session>,
    /// Reaper-side of the active set.
    pub active_rx: mpsc::Receiver<Session>,
}

/// Create the bounded channels for the lifecycle core.
///
/// The warm pool holds at most `max_warm` provisioned sessions: the creator
/// blocks when it is full, which is the natural backpressure. The active set
/// holds at most `max_active` delivered sessions: the dispatcher blocks when
/// it is full, which is the intended throughput ceiling. The request channel
/// holds a single request so clients queue on the send side and the
/// dispatcher serializes all throttle decisions.
pub fn session_channels(max_warm: usize, max_active: usize) -> SessionChannels {
    let (warm_tx, warm_rx) = mpsc::channel(max_warm);
    let (request_tx, request_rx) = mpsc::channel(1);
    let (active_tx, active_rx) = mpsc::channel(max_active);
    SessionChannels {
        warm_tx,
        warm_rx,
        request_tx,
        request_rx,
        active_tx,
        active_rx,
    }
}

/// Sender half of the shutdown broadcast, held by the coordinator.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

/// Receiver half of the shutdown broadcast, cloned into every daemon.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx })
    }

    /// Broadcast shutdown to every signal clone.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested. Resolves immediately if it already
    /// was, and also when the controller is dropped.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
