// src/config.rs — engine configuration
//
// TOML on disk, with environment-variable overrides layered on top the way
// a daemon's deploy environment typically wants.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the control-protocol listening socket.
    #[serde(default = "default_control_socket_path")]
    pub control_socket_path: String,

    /// Ring-buffer slot count used when an identity is registered without
    /// an explicit history size.
    #[serde(default = "default_history_capacity")]
    pub default_history_capacity: u32,

    /// `tracing_subscriber::EnvFilter` directive used unless `RUST_LOG` is
    /// set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Host timezone offset, minutes west of UTC, until the environment
    /// supplies a live value.
    #[serde(default)]
    pub initial_tz_offset_minutes: i32,
}

fn default_control_socket_path() -> String {
    "/run/accountantd/control.sock".to_string()
}

fn default_history_capacity() -> u32 {
    12
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_socket_path: default_control_socket_path(),
            default_history_capacity: default_history_capacity(),
            log_filter: default_log_filter(),
            initial_tz_offset_minutes: 0,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(EngineError::Io)?;
        let mut config: EngineConfig =
            toml::from_str(&contents).map_err(|e| EngineError::Config(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ACCOUNTANTD_CONTROL_SOCKET") {
            self.control_socket_path = v;
        }
        if let Ok(v) = std::env::var("ACCOUNTANTD_HISTORY_CAPACITY") {
            if let Ok(parsed) = v.parse() {
                self.default_history_capacity = parsed;
            }
        }
        if let Ok(v) = std::env::var("ACCOUNTANTD_LOG_FILTER") {
            self.log_filter = v;
        }
        if let Ok(v) = std::env::var("ACCOUNTANTD_TZ_OFFSET_MINUTES") {
            if let Ok(parsed) = v.parse() {
                self.initial_tz_offset_minutes = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.default_history_capacity, 12);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accountantd.toml");
        std::fs::write(
            &path,
            r#"
            control_socket_path = "/tmp/custom.sock"
            default_history_capacity = 5
            log_filter = "debug"
            initial_tz_offset_minutes = 300
            "#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.control_socket_path, "/tmp/custom.sock");
        assert_eq!(config.default_history_capacity, 5);
        assert_eq!(config.initial_tz_offset_minutes, 300);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = EngineConfig::load_or_default(Path::new("/nonexistent/path.toml"));
        assert_eq!(config.control_socket_path, default_control_socket_path());
    }
}
