//! Application configuration.

use std::time::Duration;

/// User-facing configuration, populated from command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host port the SSH reverse proxy listens on. Clients connect here.
    pub ssh_port: String,
    /// Address the HTTP service binds to, e.g. `":4000"`.
    pub http_addr: String,
    /// Size of the warm pool the creator keeps filled.
    pub max_warm: usize,
    /// Maximum number of simultaneously active sessions. The dispatcher
    /// blocks (and stops accepting requests) when this many are active.
    pub max_active: usize,
    /// Session lifetime in minutes, counted from activation.
    pub lifetime_minutes: u64,
    /// How often (in minutes) the reaper checks for expired sessions.
    pub reap_interval_minutes: u64,
    /// Minimum time (in minutes) between admitted requests from one IP.
    pub min_request_interval_minutes: u64,
    /// More extensive logging.
    pub debug: bool,
    /// Disable the Prometheus instrumentation entirely.
    pub no_instrumentation: bool,
    /// Image for the SSH reverse proxy container.
    pub proxy_image: String,
    /// Tag for the entrypoint image built at startup.
    pub entrypoint_image: String,
    /// Directory with the Dockerfile for the entrypoint image.
    pub entrypoint_src: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_port: "50000".to_string(),
            http_addr: ":4000".to_string(),
            max_warm: 15,
            max_active: 140,
            lifetime_minutes: 150,
            reap_interval_minutes: 10,
            min_request_interval_minutes: 5,
            debug: false,
            no_instrumentation: false,
            proxy_image: "sshpiperd".to_string(),
            entrypoint_image: "entrypoint".to_string(),
            entrypoint_src: "./entrypoint".to_string(),
        }
    }
}

impl Config {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_minutes * 60)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_minutes * 60)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_secs(self.min_request_interval_minutes * 60)
    }

    /// Bind address for the HTTP listener. A bare `":port"` means all
    /// interfaces.
    pub fn listen_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.ssh_port, "50000");
        assert_eq!(config.http_addr, ":4000");
        assert_eq!(config.max_warm, 15);
        assert_eq!(config.max_active, 140);
        assert_eq!(config.lifetime_minutes, 150);
        assert_eq!(config.reap_interval_minutes, 10);
        assert_eq!(config.min_request_interval_minutes, 5);
        assert!(!config.debug);
        assert!(!config.no_instrumentation);
    }

    #[test]
    fn test_listen_addr_expands_bare_port() {
        let config = Config {
            http_addr: ":4000".to_string(),
            ..Default::default()
        };
        assert_eq!(config.listen_addr(), "0.0.0.0:4000");

        let config = Config {
            http_addr: "127.0.0.1:8080".to_string(),
            ..Default::default()
        };
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_durations_convert_from_minutes() {
        let config = Config::default();
        assert_eq!(config.lifetime(), Duration::from_secs(150 * 60));
        assert_eq!(config.reap_interval(), Duration::from_secs(10 * 60));
        assert_eq!(config.min_request_interval(), Duration::from_secs(5 * 60));
    }
}
