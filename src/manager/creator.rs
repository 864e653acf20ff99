//! Session creator daemon.
//!
//! Keeps the warm pool full: builds one session at a time and sends it into
//! the pool, blocking while the pool is at capacity. On factory failure it
//! retries with bounded exponential backoff so a persistently failing
//! container runtime cannot spin the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::docker::{stop_session_containers, ContainerRuntime};
use crate::manager::ShutdownSignal;
use crate::metrics::SessionObserver;
use crate::session::{Session, SessionFactory};

/// First retry delay after a factory failure.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Ceiling for the retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Result of offering a freshly built session to the warm pool.
enum SendOutcome {
    /// The named session entered the pool.
    Pooled(String),
    /// Cancellation interrupted the send; the session must be stopped.
    Aborted(Session),
}

pub struct Creator {
    factory: SessionFactory,
    runtime: Arc<dyn ContainerRuntime>,
    warm_tx: mpsc::Sender<Session>,
    shutdown: ShutdownSignal,
    observer: Arc<dyn SessionObserver>,
}

impl Creator {
    pub fn new(
        factory: SessionFactory,
        runtime: Arc<dyn ContainerRuntime>,
        warm_tx: mpsc::Sender<Session>,
        shutdown: ShutdownSignal,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            factory,
            runtime,
            warm_tx,
            shutdown,
            observer,
        }
    }

    /// Run until shutdown. A panic escaping the loop body is logged and the
    /// loop restarted: a silently dead creator would starve the warm pool and
    /// eventually deadlock the dispatcher.
    pub async fn run(mut self) {
        loop {
            match AssertUnwindSafe(self.serve()).catch_unwind().await {
                Ok(()) => {
                    tracing::info!("scd: shutting down");
                    return;
                }
                Err(_) => {
                    tracing::error!("scd: daemon loop panicked, restarting");
                }
            }
        }
    }

    async fn serve(&mut self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            let session = match self.factory.create_session().await {
                Ok(session) => {
                    backoff = BACKOFF_BASE;
                    session
                }
                Err(e) => {
                    tracing::error!(error = %e, retry_in = ?backoff, "scd: unable to create session");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.recv() => return,
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };
            self.observer.session_created();

            // Self must not be touched inside the select arms: the pending
            // branch futures still hold their field borrows while an arm
            // body runs.
            let outcome = tokio::select! {
                permit = self.warm_tx.reserve() => match permit {
                    Ok(permit) => {
                        let name = session.name.clone();
                        permit.send(session);
                        SendOutcome::Pooled(name)
                    }
                    // Pool receiver is gone; treat like cancellation.
                    Err(_) => SendOutcome::Aborted(session),
                },
                _ = self.shutdown.recv() => SendOutcome::Aborted(session),
            };

            match outcome {
                SendOutcome::Pooled(name) => {
                    self.observer.warm_added();
                    tracing::info!(session = %name, "scd: sent new session to the warm pool");
                }
                SendOutcome::Aborted(session) => {
                    // Built but never pooled: stop it here, the shutdown
                    // drain only sees sessions inside the channels.
                    self.stop_unsent(session).await;
                    return;
                }
            }
        }
    }

    async fn stop_unsent(&self, session: Session) {
        if let Err(e) =
            stop_session_containers(self.runtime.as_ref(), &session.name, &session.container_ids)
                .await
        {
            tracing::error!(
                error = %e,
                session = %session.name,
                "scd: unable to stop session dangling outside of any pool"
            );
        }
    }
}
