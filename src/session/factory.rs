//! Session provisioning.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::error::SessionError;
use crate::session::{credentials, Session};

/// Upper bound on each provisioning exec (`useradd`, `chpasswd`, pipe
/// registration) so a wedged container cannot stall the creator forever.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds fully provisioned sessions.
///
/// The factory holds the runtime handle, the entrypoint image tag, and the
/// identity of the reverse proxy (its network and container) that every new
/// upstream container is wired into.
pub struct SessionFactory {
    runtime: Arc<dyn ContainerRuntime>,
    entrypoint_image: String,
    proxy_network_id: String,
    proxy_container_id: String,
}

impl SessionFactory {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        entrypoint_image: String,
        proxy_network_id: String,
        proxy_container_id: String,
    ) -> Self {
        Self {
            runtime,
            entrypoint_image,
            proxy_network_id,
            proxy_container_id,
        }
    }

    /// Provision one session: generate credentials, start an upstream
    /// container attached to the proxy network, create the user account
    /// inside it, and register the SSH pipe mapping on the proxy.
    ///
    /// Stops at the first failure. There is no compensation pass: a container
    /// created before a later step fails is left running and only reported in
    /// the logs.
    pub async fn create_session(&self) -> Result<Session, SessionError> {
        let username = credentials::random_username()?;
        let password = credentials::random_password()?;
        let name = username[..6].to_string();
        let time_created = Instant::now();

        let spec = ContainerSpec::upstream(&name, &self.entrypoint_image, &self.proxy_network_id);
        let entrypoint_id = self.runtime.run_container(&spec).await.map_err(|e| {
            tracing::debug!(session = %name, "entrypoint container creation failed");
            e
        })?;
        tracing::debug!(session = %name, container = %entrypoint_id, "created upstream container");

        let session = Session {
            name,
            username,
            password,
            container_ids: vec![entrypoint_id.clone()],
            time_created,
            time_activated: None,
        };

        self.create_user(&entrypoint_id, &session.username, &session.password)
            .await?;
        tracing::debug!(user = %session.username, session = %session.name, "created user in upstream container");

        self.register_pipe(&session.name, &session.username).await?;
        tracing::debug!(session = %session.name, "registered upstream on the reverse proxy");

        tracing::info!(username = %session.username, session = %session.name, "new session created");

        Ok(session)
    }

    /// Create a user account with the given password inside a running
    /// container.
    async fn create_user(
        &self,
        container_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        let useradd = vec![
            "useradd".to_string(),
            "--create-home".to_string(),
            "--user-group".to_string(),
            "--shell".to_string(),
            "/bin/bash".to_string(),
            username.to_string(),
        ];
        self.runtime
            .exec(container_id, useradd, Some(EXEC_TIMEOUT))
            .await?;

        // chpasswd reads `user:password` from stdin, so the pair has to be
        // piped through a shell; a direct exec of chpasswd does not work.
        let chpasswd = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("echo {username}:{password} | chpasswd"),
        ];
        self.runtime
            .exec(container_id, chpasswd, Some(EXEC_TIMEOUT))
            .await?;

        Ok(())
    }

    /// Register the session's container as an upstream on the SSH reverse
    /// proxy, keyed by the SSH username the client will log in with. The
    /// upstream account name equals the public username by convention.
    async fn register_pipe(&self, container_name: &str, username: &str) -> Result<(), SessionError> {
        let pipe_add = vec![
            "/sshpiperd".to_string(),
            "pipe".to_string(),
            "add".to_string(),
            "-n".to_string(),
            username.to_string(),
            "-u".to_string(),
            container_name.to_string(),
            "--upstream-username".to_string(),
            username.to_string(),
        ];
        self.runtime
            .exec(&self.proxy_container_id, pipe_add, Some(EXEC_TIMEOUT))
            .await?;
        Ok(())
    }
}
