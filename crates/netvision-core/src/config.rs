//! Project configuration.
//!
//! Hosts drop an optional `netvision.config.json` next to their project; every
//! field has a development default so the tooling works with no file at all.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// File name probed during discovery.
pub const CONFIG_FILE: &str = "netvision.config.json";

/// Environment variable forcing production mode in child processes.
pub const PRODUCTION_ENV: &str = "NETVISION_PRODUCTION";

pub const DEFAULT_WS_PORT: u16 = 8970;
pub const DEFAULT_DISCOVERY_PORT: u16 = 8971;
pub const DEFAULT_CONTROL_PORT: u16 = 8972;
pub const DEFAULT_VIEWER_PORT: u16 = 5173;
pub const DEFAULT_LOG_RETENTION: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetvisionConfig {
    /// Production mode serves the built viewer and silences child stdio.
    pub production: bool,
    /// Relay hub WebSocket port, also the port advertised by discovery.
    pub ws_port: u16,
    /// UDP port the discovery beacon binds and broadcasts on.
    pub discovery_port: u16,
    /// Control-plane HTTP port of the supervisor daemon.
    pub control_port: u16,
    /// Port the viewer is reachable on once its host process is up.
    pub viewer_port: u16,
    /// Ports reverse-forwarded to attached devices. Empty means "just the
    /// relay port"; see [`NetvisionConfig::effective_forward_ports`].
    pub forward_ports: Vec<u16>,
    /// Command launching the viewer in development.
    pub viewer_dev_command: Vec<String>,
    /// Command serving the built viewer in production.
    pub viewer_prod_command: Vec<String>,
    /// Maximum log rows kept on disk; 0 disables the cap.
    pub log_retention: usize,
}

impl Default for NetvisionConfig {
    fn default() -> Self {
        Self {
            production: false,
            ws_port: DEFAULT_WS_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            viewer_port: DEFAULT_VIEWER_PORT,
            forward_ports: Vec::new(),
            viewer_dev_command: vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
            viewer_prod_command: vec![
                "npm".to_string(),
                "run".to_string(),
                "preview".to_string(),
            ],
            log_retention: DEFAULT_LOG_RETENTION,
        }
    }
}

impl NetvisionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Probe the usual locations for a config file: the project root, the
    /// directory of the current executable, then the project's parent. Falls
    /// back to defaults when nothing is found or nothing parses.
    pub fn discover(project_root: &Path) -> Self {
        let mut candidates: Vec<PathBuf> = vec![project_root.join(CONFIG_FILE)];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(CONFIG_FILE));
            }
        }
        if let Some(parent) = project_root.parent() {
            candidates.push(parent.join(CONFIG_FILE));
        }

        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            match Self::load(&candidate) {
                Ok(config) => {
                    info!(path = %candidate.display(), "Loaded project config");
                    return config;
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Ignoring unreadable config");
                }
            }
        }

        info!("No {CONFIG_FILE} found, using development defaults");
        Self::default()
    }

    /// Apply environment overrides. `NETVISION_PRODUCTION=1` (or `true`)
    /// forces production mode, which is how the trigger hands its mode down
    /// to spawned children.
    pub fn apply_env(mut self) -> Self {
        if let Ok(value) = std::env::var(PRODUCTION_ENV) {
            self.production = value == "1" || value.eq_ignore_ascii_case("true");
        }
        self
    }

    /// Ports to reverse-forward to attached devices.
    pub fn effective_forward_ports(&self) -> Vec<u16> {
        if self.forward_ports.is_empty() {
            vec![self.ws_port]
        } else {
            self.forward_ports.clone()
        }
    }

    /// Command line for the viewer child in the current mode.
    pub fn viewer_command(&self) -> &[String] {
        if self.production {
            &self.viewer_prod_command
        } else {
            &self.viewer_dev_command
        }
    }

    pub fn viewer_url(&self) -> String {
        format!("http://localhost:{}", self.viewer_port)
    }

    pub fn control_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.control_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetvisionConfig::default();
        assert!(!config.production);
        assert_eq!(config.ws_port, 8970);
        assert_eq!(config.discovery_port, 8971);
        assert_eq!(config.control_port, 8972);
        assert_eq!(config.viewer_url(), "http://localhost:5173");
        assert_eq!(config.effective_forward_ports(), vec![8970]);
        assert_eq!(config.viewer_command(), ["npm", "run", "dev"]);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"wsPort": 9000, "production": true}"#).unwrap();

        let config = NetvisionConfig::load(&path).unwrap();
        assert!(config.production);
        assert_eq!(config.ws_port, 9000);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.viewer_command(), ["npm", "run", "preview"]);
    }

    #[test]
    fn test_discover_prefers_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join(CONFIG_FILE), r#"{"wsPort": 9100}"#).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"wsPort": 9200}"#).unwrap();

        let config = NetvisionConfig::discover(&root);
        assert_eq!(config.ws_port, 9100);
    }

    #[test]
    fn test_discover_falls_back_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"wsPort": 9200}"#).unwrap();

        let config = NetvisionConfig::discover(&root);
        assert_eq!(config.ws_port, 9200);
    }

    #[test]
    fn test_discover_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetvisionConfig::discover(dir.path());
        assert_eq!(config, NetvisionConfig::default());
    }

    #[test]
    fn test_explicit_forward_ports_win() {
        let config = NetvisionConfig {
            forward_ports: vec![8970, 5173, 8081],
            ..Default::default()
        };
        assert_eq!(config.effective_forward_ports(), vec![8970, 5173, 8081]);
    }
}
