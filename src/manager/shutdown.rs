//! Shutdown drain.
//!
//! After the daemons have acknowledged cancellation, whatever sessions remain
//! in the warm pool, the active set, or the daemons' hand-back slots are
//! stopped here. Errors are logged and the drain continues: one stubborn
//! container must not keep the rest alive.

use tokio::sync::mpsc;

use crate::docker::{stop_session_containers, ContainerRuntime};
use crate::manager::{Dispatcher, Reaper};
use crate::session::Session;

/// Stop every remaining session: first the warm pool, then the active set,
/// then the sessions the dispatcher and reaper were holding outside the
/// channels when they were cancelled.
pub async fn drain_sessions(runtime: &dyn ContainerRuntime, dispatcher: Dispatcher, reaper: Reaper) {
    let (mut warm_rx, in_hand) = dispatcher.into_drain_parts();
    let (mut active_rx, lookahead) = reaper.into_drain_parts();

    drain_channel(runtime, &mut warm_rx).await;
    tracing::info!("finished stopping sessions from the warm pool");

    drain_channel(runtime, &mut active_rx).await;
    tracing::info!("finished stopping sessions from the active set");

    for session in [in_hand, lookahead].into_iter().flatten() {
        stop_logged(runtime, &session).await;
    }
}

async fn drain_channel(runtime: &dyn ContainerRuntime, rx: &mut mpsc::Receiver<Session>) {
    loop {
        match rx.try_recv() {
            Ok(session) => stop_logged(runtime, &session).await,
            Err(_) => return,
        }
    }
}

async fn stop_logged(runtime: &dyn ContainerRuntime, session: &Session) {
    if let Err(e) =
        stop_session_containers(runtime, &session.name, &session.container_ids).await
    {
        tracing::error!(error = %e, session = %session.name, "error stopping session at shutdown");
    }
}
