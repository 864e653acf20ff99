//! SSH reverse proxy bootstrap and teardown.
//!
//! A single sshpiperd container fronts every session: clients connect to one
//! fixed host port and the proxy routes them to their upstream container by
//! SSH username. The proxy, its bridge network, and its state directory are
//! owned by the process for its whole lifetime.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::error::BootError;

/// Name of the bridge network shared by the proxy and all upstreams.
pub const PROXY_NETWORK_NAME: &str = "reverseProxy";

/// Name (and hostname) of the proxy container.
pub const PROXY_CONTAINER_NAME: &str = "piperSSH";

/// Host directory mounted into the proxy for its persistent state.
pub const PIPER_STATE_DIR: &str = "/tmp/sshpiper";

/// SSH port the proxy listens on inside its container.
const PROXY_INTERNAL_PORT: &str = "2222/tcp";

/// Handles to the running reverse proxy, needed for pipe registration and
/// teardown.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    pub network_id: String,
    pub container_id: String,
}

/// Create the proxy network, prepare the proxy state directory, and start
/// the proxy container. Must complete before any session daemon starts; any
/// failure is fatal.
pub async fn initialize(
    runtime: &dyn ContainerRuntime,
    proxy_image: &str,
    ssh_port: &str,
) -> Result<ReverseProxy, BootError> {
    let network_id = runtime.create_network(PROXY_NETWORK_NAME).await?;
    tracing::debug!(network = %short_id(&network_id), "created reverse proxy network");

    prepare_piper_filesystem(Path::new(PIPER_STATE_DIR))?;

    let spec = ContainerSpec {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: proxy_image.to_string(),
        auto_remove: true,
        tty: false,
        attach_stdin: false,
        exposed_ports: vec![PROXY_INTERNAL_PORT.to_string()],
        port_bindings: vec![(
            PROXY_INTERNAL_PORT.to_string(),
            "0.0.0.0".to_string(),
            ssh_port.to_string(),
        )],
        // The host RSA key is bind-mounted so the proxy presents the same
        // host key across restarts; a fresh key every run would trip the
        // clients' man-in-the-middle protection.
        binds: vec![
            format!("{PIPER_STATE_DIR}:/var/sshpiper"),
            "/etc/ssh/ssh_host_rsa_key:/etc/ssh/ssh_host_rsa_key".to_string(),
        ],
        network_id: network_id.clone(),
    };

    let container_id = runtime.run_container(&spec).await?;
    tracing::info!(
        container = %short_id(&container_id),
        port = ssh_port,
        "SSH reverse proxy container started"
    );

    Ok(ReverseProxy {
        network_id,
        container_id,
    })
}

/// Stop the proxy container and remove its network. Called last during
/// shutdown, after every session has been drained.
pub async fn teardown(
    runtime: &dyn ContainerRuntime,
    proxy: &ReverseProxy,
) -> Result<(), crate::error::RuntimeError> {
    runtime.stop_container(&proxy.container_id, None).await?;
    runtime.remove_network(&proxy.network_id).await?;
    Ok(())
}

/// Clear and recreate the host directory mounted into the proxy.
///
/// WARNING: removes any state left over from previous runs.
fn prepare_piper_filesystem(dir: &Path) -> Result<(), BootError> {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            // Keep going: creation below may still succeed.
            tracing::error!(error = %e, path = %dir.display(), "could not clear proxy state directory");
        }
    }

    fs::create_dir_all(dir).map_err(|e| BootError::PiperFilesystem {
        path: dir.display().to_string(),
        source: e,
    })?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o750)).map_err(|e| {
        BootError::PiperFilesystem {
            path: dir.display().to_string(),
            source: e,
        }
    })?;

    Ok(())
}

/// First characters of a container or network id, for logging.
fn short_id(id: &str) -> &str {
    &id[..id.len().min(10)]
}
