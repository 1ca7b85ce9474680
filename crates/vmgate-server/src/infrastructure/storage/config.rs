//! TOML-based configuration for the gateway server.
//!
//! # Example file
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! cable_port = 4567
//! log_level = "info"
//!
//! [screenshots]
//! directory = "public/screenshots"
//! serve_static = true
//! timeout_secs = 30
//!
//! [[hypervisors]]
//! id = 1
//! name = "local"
//! uri = "test:///default"
//! ```
//!
//! # Serde default values
//!
//! Every field is annotated with `#[serde(default = "some_fn")]`, so a file
//! may leave out any section or key.  With no `[[hypervisors]]` entries at all
//! the gateway connects to a single `test:///default` host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmgate_core::HypervisorId;

use crate::application::catalog::HypervisorEndpoint;

/// Connection URI used when no hypervisor is configured.
pub const DEFAULT_HYPERVISOR_URI: &str = "test:///default";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two `[[hypervisors]]` entries share an id.
    #[error("duplicate hypervisor id {0}")]
    DuplicateHypervisor(u32),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub screenshots: ScreenshotConfig,
    #[serde(default)]
    pub hypervisors: Vec<HypervisorEntry>,
}

/// Listener and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address the cable server binds to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port of the cable WebSocket.
    #[serde(default = "default_cable_port")]
    pub cable_port: u16,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where screenshots are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotConfig {
    #[serde(default = "default_screenshot_dir")]
    pub directory: PathBuf,
    /// Whether the HTTP layer serves `directory` under `/screenshots`.
    #[serde(default = "default_true")]
    pub serve_static: bool,
    /// How long a capture may take before it is reported as failed.
    #[serde(default = "default_screenshot_timeout_secs")]
    pub timeout_secs: u64,
}

impl ScreenshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One `[[hypervisors]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HypervisorEntry {
    pub id: u32,
    pub name: String,
    pub uri: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_cable_port() -> u16 {
    4567
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_screenshot_dir() -> PathBuf {
    PathBuf::from("public/screenshots")
}
fn default_true() -> bool {
    true
}
fn default_screenshot_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cable_port: default_cable_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            directory: default_screenshot_dir(),
            serve_static: default_true(),
            timeout_secs: default_screenshot_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// `bind_address:cable_port`.
    pub fn cable_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.cable_port)
    }

    /// The endpoints to connect to, falling back to `test:///default`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateHypervisor`] if two entries share an id.
    pub fn endpoints(&self) -> Result<Vec<HypervisorEndpoint>, ConfigError> {
        if self.hypervisors.is_empty() {
            return Ok(vec![HypervisorEndpoint {
                id: HypervisorId(1),
                name: "default".to_string(),
                uri: DEFAULT_HYPERVISOR_URI.to_string(),
            }]);
        }

        let mut endpoints: Vec<HypervisorEndpoint> = Vec::with_capacity(self.hypervisors.len());
        for entry in &self.hypervisors {
            if endpoints.iter().any(|e| e.id.0 == entry.id) {
                return Err(ConfigError::DuplicateHypervisor(entry.id));
            }
            endpoints.push(HypervisorEndpoint {
                id: HypervisorId(entry.id),
                name: entry.name.clone(),
                uri: entry.uri.clone(),
            });
        }
        Ok(endpoints)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_app_config_default_has_expected_listener() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.server.cable_port, 4567);
        assert_eq!(cfg.cable_addr(), "0.0.0.0:4567");
        assert_eq!(cfg.server.log_level, "info");
    }

    #[test]
    fn test_screenshot_defaults() {
        let cfg = ScreenshotConfig::default();
        assert_eq!(cfg.directory, PathBuf::from("public/screenshots"));
        assert!(cfg.serve_static);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_no_hypervisors_falls_back_to_test_default() {
        // Arrange
        let cfg = AppConfig::default();

        // Act
        let endpoints = cfg.endpoints().unwrap();

        // Assert
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].uri, "test:///default");
        assert_eq!(endpoints[0].id, HypervisorId(1));
    }

    #[test]
    fn test_partial_server_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[server]
cable_port = 9999

[[hypervisors]]
id = 3
name = "rack-a"
uri = "qemu+ssh://rack-a/system"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.server.cable_port, 9999);
        assert_eq!(cfg.server.bind_address, "0.0.0.0");
        let endpoints = cfg.endpoints().unwrap();
        assert_eq!(endpoints[0].id, HypervisorId(3));
        assert_eq!(endpoints[0].name, "rack-a");
    }

    #[test]
    fn test_duplicate_hypervisor_ids_are_rejected() {
        let toml_str = r#"
[[hypervisors]]
id = 1
name = "a"
uri = "test:///default"

[[hypervisors]]
id = 1
name = "b"
uri = "test:///empty"
"#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert!(matches!(
            cfg.endpoints(),
            Err(ConfigError::DuplicateHypervisor(1))
        ));
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let result: Result<AppConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/vmgate.toml");

        let cfg = load_config(&path).unwrap();

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_load_config_reads_file_from_disk() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("vmgate_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vmgate.toml");
        std::fs::write(
            &path,
            concat!(
                "[server]\ncable_port = 12345\n\n",
                "[[hypervisors]]\nid = 2\nname = \"lab\"\nuri = \"test:///empty\"\n",
            ),
        )
        .unwrap();

        // Act
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded.server.cable_port, 12345);
        assert_eq!(
            loaded.hypervisors,
            vec![HypervisorEntry {
                id: 2,
                name: "lab".to_string(),
                uri: "test:///empty".to_string(),
            }]
        );

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_config_reports_parse_error_for_malformed_file() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("vmgate_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vmgate.toml");
        std::fs::write(&path, "[server\ncable_port = ").unwrap();

        // Act
        let result = load_config(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }
}
