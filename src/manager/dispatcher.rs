//! Session dispatcher daemon.
//!
//! A single task serializes every dispatch decision: per-client throttling,
//! assignment from the warm pool, and placement on the active set. Because
//! only this task touches the throttle table, no locking is needed and
//! throttle decisions for a given client are totally ordered.

use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::error::RequestError;
use crate::manager::{ClientRequest, ShutdownSignal};
use crate::metrics::SessionObserver;
use crate::session::Session;

pub struct Dispatcher {
    requests: mpsc::Receiver<ClientRequest>,
    warm_rx: mpsc::Receiver<Session>,
    active_tx: mpsc::Sender<Session>,
    min_interval: Duration,
    shutdown: ShutdownSignal,
    observer: Arc<dyn SessionObserver>,
    /// Last admitted request per client address. Only this task reads or
    /// writes it.
    last_request: HashMap<IpAddr, Instant>,
    /// A session taken from the warm pool and delivered to a client, but not
    /// yet placed on the active set when shutdown interrupted the blocking
    /// put. Handed to the shutdown drain so it is still reclaimed.
    in_hand: Option<Session>,
}

impl Dispatcher {
    pub fn new(
        requests: mpsc::Receiver<ClientRequest>,
        warm_rx: mpsc::Receiver<Session>,
        active_tx: mpsc::Sender<Session>,
        min_interval: Duration,
        shutdown: ShutdownSignal,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            requests,
            warm_rx,
            active_tx,
            min_interval,
            shutdown,
            observer,
            last_request: HashMap::new(),
            in_hand: None,
        }
    }

    /// Run until shutdown, then return `self` so the shutdown coordinator can
    /// drain the warm pool and reclaim any in-hand session. Panics escaping
    /// the loop body are logged and the loop restarted.
    pub async fn run(mut self) -> Self {
        loop {
            match AssertUnwindSafe(self.serve()).catch_unwind().await {
                Ok(()) => {
                    tracing::info!("smd: shutting down");
                    return self;
                }
                Err(_) => {
                    tracing::error!("smd: daemon loop panicked, restarting");
                }
            }
        }
    }

    async fn serve(&mut self) {
        loop {
            let request = tokio::select! {
                maybe = self.requests.recv() => match maybe {
                    Some(request) => request,
                    None => return, // ingress closed
                },
                _ = self.shutdown.recv() => return,
            };

            if self.dispatch(request).await.is_err() {
                return;
            }
        }
    }

    /// Serve one request. `Err` means the daemon must exit (shutdown arrived
    /// or a pool endpoint closed).
    async fn dispatch(&mut self, request: ClientRequest) -> Result<(), ()> {
        let client_ip = request.client_ip;

        match self.last_request.get(&client_ip) {
            None => {
                tracing::info!(client = %client_ip, "smd: client is establishing a connection for the first time");
            }
            Some(last) => {
                if last.elapsed() < self.min_interval {
                    tracing::info!(client = %client_ip, "smd: not enough time has passed since last request");
                    let _ = request.respond_to.send(Err(RequestError::TooSoon));
                    return Ok(());
                }
            }
        }
        // The table is updated before the pool-empty check below, so a client
        // that receives `NoSessionsAvailable` is still throttled. Documented
        // behavior, kept.
        self.last_request.insert(client_ip, Instant::now());

        let mut session = match self.warm_rx.try_recv() {
            Ok(session) => session,
            Err(TryRecvError::Empty) => {
                let _ = request.respond_to.send(Err(RequestError::NoSessionsAvailable));
                return Ok(());
            }
            Err(TryRecvError::Disconnected) => {
                let _ = request.respond_to.send(Err(RequestError::Closed));
                return Err(());
            }
        };
        self.observer.warm_taken();

        session.time_activated = Some(Instant::now());
        let name = session.name.clone();
        let _ = request.respond_to.send(Ok(session.clone()));
        tracing::info!(session = %name, client = %client_ip, "smd: session delivered");

        // Blocking put on the active set. When it is full the service is at
        // its stated ceiling: this task stalls here and no further requests
        // are accepted until the reaper frees a slot. Self is only touched
        // after the select: the pending branch futures still hold their
        // field borrows while an arm body runs.
        let placed = tokio::select! {
            permit = self.active_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(session);
                    None
                }
                Err(_) => Some(session),
            },
            _ = self.shutdown.recv() => Some(session),
        };

        match placed {
            None => {
                self.observer.active_added();
                Ok(())
            }
            Some(session) => {
                self.in_hand = Some(session);
                Err(())
            }
        }
    }

    /// Hand the warm pool receiver and any in-hand session to the shutdown
    /// drain.
    pub fn into_drain_parts(self) -> (mpsc::Receiver<Session>, Option<Session>) {
        (self.warm_rx, self.in_hand)
    }
}
