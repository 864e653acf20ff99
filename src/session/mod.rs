//! Session data model and provisioning.

pub mod credentials;
pub mod factory;

pub use factory::SessionFactory;

use tokio::time::Instant;

/// A provisioned container assignment for one end user.
///
/// A session is in exactly one of four states: provisioning (inside the
/// factory), warm (in the pool), active (delivered to a client and queued for
/// expiry), or terminated. `time_activated` is set exactly when the session
/// becomes active.
#[derive(Debug, Clone)]
pub struct Session {
    /// Short unique identifier: the first six characters of `username`. Also
    /// used as the upstream container's name and hostname.
    pub name: String,
    /// SSH username delivered to the client.
    pub username: String,
    /// SSH password delivered to the client.
    pub password: String,
    /// Ids of every container belonging to this session, the entrypoint
    /// upstream first.
    pub container_ids: Vec<String>,
    /// When provisioning completed.
    pub time_created: Instant,
    /// When the dispatcher handed the session to a client; `None` while the
    /// session is still warm.
    pub time_activated: Option<Instant>,
}
