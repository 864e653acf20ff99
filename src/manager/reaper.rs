//! Session reaper daemon.
//!
//! Periodically sweeps the active set and stops sessions whose lifetime has
//! expired, strictly oldest-first. The active set is FIFO in activation
//! order, so only its head can be expired; a single retained lookahead slot
//! keeps the head available across ticks without ever reordering the queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::docker::{stop_session_containers, ContainerRuntime};
use crate::manager::ShutdownSignal;
use crate::metrics::SessionObserver;
use crate::session::Session;

pub struct Reaper {
    active_rx: mpsc::Receiver<Session>,
    runtime: Arc<dyn ContainerRuntime>,
    max_lifetime: Duration,
    interval: Duration,
    shutdown: ShutdownSignal,
    observer: Arc<dyn SessionObserver>,
    /// The oldest known un-expired session, held out of the channel between
    /// ticks. Invariant: the active set plus this slot remain totally
    /// ordered by activation time, with this slot as the head.
    lookahead: Option<Session>,
}

impl Reaper {
    pub fn new(
        active_rx: mpsc::Receiver<Session>,
        runtime: Arc<dyn ContainerRuntime>,
        max_lifetime: Duration,
        interval: Duration,
        shutdown: ShutdownSignal,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            active_rx,
            runtime,
            max_lifetime,
            interval,
            shutdown,
            observer,
            lookahead: None,
        }
    }

    /// Run until shutdown, then return `self` so the shutdown coordinator can
    /// drain the active set and reclaim the retained lookahead session.
    /// Panics escaping the loop body are logged and the loop restarted.
    pub async fn run(mut self) -> Self {
        loop {
            match AssertUnwindSafe(self.serve()).catch_unwind().await {
                Ok(()) => {
                    tracing::info!("srd: shutting down");
                    return self;
                }
                Err(_) => {
                    tracing::error!("srd: daemon loop panicked, restarting");
                }
            }
        }
    }

    async fn serve(&mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        // A slow sweep must not be followed by a burst of catch-up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tracing::debug!(next_check = ?self.interval, "srd: next check scheduled");
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.recv() => return,
            }
            tracing::debug!("srd: checking max lifetime of active sessions");
            self.sweep().await;
        }
    }

    /// Stop expired sessions from the head of the active set until the set is
    /// empty or the head has lifetime left.
    async fn sweep(&mut self) {
        loop {
            let candidate = match self.lookahead.take() {
                Some(session) => session,
                None => match self.active_rx.try_recv() {
                    Ok(session) => session,
                    // Empty or closed: nothing left to examine this tick.
                    Err(_) => return,
                },
            };

            // Sessions only enter the active set after the dispatcher stamps
            // them; fall back to the creation time if one slipped through.
            let activated = candidate.time_activated.unwrap_or(candidate.time_created);
            if activated.elapsed() <= self.max_lifetime {
                // Not expired: retain it as the head for the next tick. It
                // must not go back into the channel, that would break the
                // FIFO activation order.
                self.lookahead = Some(candidate);
                return;
            }

            match stop_session_containers(
                self.runtime.as_ref(),
                &candidate.name,
                &candidate.container_ids,
            )
            .await
            {
                Ok(()) => {
                    tracing::info!(session = %candidate.name, "srd: expired session stopped");
                    self.observer.active_removed();
                }
                Err(e) => {
                    // Drop the candidate and defer the rest of the sweep to
                    // the next tick rather than retrying in a tight loop.
                    tracing::error!(error = %e, session = %candidate.name, "srd: unable to stop expired session");
                    self.observer.active_removed();
                    return;
                }
            }
        }
    }

    /// Hand the active set receiver and the retained lookahead session to the
    /// shutdown drain. Without this the lookahead session would escape the
    /// drain and leak its container.
    pub fn into_drain_parts(self) -> (mpsc::Receiver<Session>, Option<Session>) {
        (self.active_rx, self.lookahead)
    }
}
