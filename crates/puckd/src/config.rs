use std::path::PathBuf;

use puck_common::{Error, Result};
use puck_manager::ManagerConfig;
use puck_router::RouterConfig;

/// Daemon configuration. Loading from files or the environment belongs to
/// the CLI layer; the daemon takes the struct as-is.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for all on-disk state.
    pub data_dir: PathBuf,
    /// Image used when create receives an empty image.
    pub default_image: String,
    pub router_port: u16,
    pub router_domain: String,
    /// When set, enables the secondary ingress listener.
    pub tailnet: Option<String>,
    /// Minutes of inactivity before idle sleep. Reserved; nothing consumes
    /// it yet.
    pub idle_timeout: u64,
    /// Override for podman socket auto-detection.
    pub podman_socket: Option<PathBuf>,
    /// Override for the control-socket path.
    pub daemon_socket: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let daemon_socket = data_dir.join("puckd.sock");
        Self {
            data_dir,
            default_image: "fedora:latest".to_string(),
            router_port: 8080,
            router_domain: "localhost".to_string(),
            tailnet: None,
            idle_timeout: 15,
            podman_socket: None,
            daemon_socket,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("puck");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local").join("share").join("puck")
}

impl Config {
    pub fn pucks_dir(&self) -> PathBuf {
        self.data_dir.join("pucks")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("puck.db")
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| Error::Fatal(format!("creating data directory: {e}")))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            default_image: self.default_image.clone(),
            pucks_dir: self.pucks_dir(),
            snapshots_dir: self.snapshots_dir(),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            port: self.router_port,
            domain: self.router_domain.clone(),
            tailnet: self.tailnet.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/srv/puck"),
            ..Default::default()
        };
        assert_eq!(cfg.pucks_dir(), PathBuf::from("/srv/puck/pucks"));
        assert_eq!(cfg.snapshots_dir(), PathBuf::from("/srv/puck/snapshots"));
        assert_eq!(cfg.database_path(), PathBuf::from("/srv/puck/puck.db"));
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cfg = Config::default();
        assert_eq!(cfg.default_image, "fedora:latest");
        assert_eq!(cfg.router_port, 8080);
        assert_eq!(cfg.router_domain, "localhost");
        assert!(cfg.tailnet.is_none());
        assert!(cfg.daemon_socket.ends_with("puckd.sock"));
    }
}
