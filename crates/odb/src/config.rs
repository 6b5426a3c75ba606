//! Layered server configuration: built-in defaults, overlaid by a YAML
//! file, overlaid by CLI flags. The shape is shared between the library
//! (default values, YAML schema) and the server binary (which owns the
//! `clap` parser and does the actual overlaying).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_address() -> SocketAddr {
    "127.0.0.1:3335".parse().unwrap()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./odb-data")
}

fn default_session_idle_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// YAML-deserializable configuration file. Every field has a built-in
/// default, so an absent or partial file is never an error.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// When set, listen on this Unix domain socket instead of `address`.
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// A `FileDescriptorSet` to fold into the registry at startup, on top
    /// of the statically-linked types, before the persisted schema (if
    /// any) is layered in.
    #[serde(default)]
    pub schema_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: default_address(),
            unix_socket: None,
            data_dir: default_data_dir(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            log_level: default_log_level(),
            schema_file: None,
        }
    }
}

impl Config {
    /// Parse a config file's contents. Missing fields fall back to
    /// built-in defaults.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let cfg = Config::from_yaml("").unwrap();
        assert_eq!(cfg.address, default_address());
        assert_eq!(cfg.session_idle_timeout_secs, 300);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let cfg = Config::from_yaml("log_level: debug\n").unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.data_dir, default_data_dir());
    }
}
