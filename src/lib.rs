//! ctfpool: per-user, ephemeral, SSH-reachable Linux container sessions for
//! CTF events.
//!
//! Clients request a session over HTTP and receive throwaway credentials.
//! Those credentials, used against one fixed SSH endpoint, are routed by an
//! SSH reverse proxy into a container dedicated to that user for a bounded
//! lifetime. A warm pool of pre-provisioned sessions keeps request latency
//! dominated by HTTP I/O.

pub mod config;
pub mod docker;
pub mod error;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod proxy;
pub mod session;
