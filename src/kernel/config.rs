//! Kernel transport configuration.
//!
//! A `KernelConfig` is either built for fresh ports (`KernelConfig::new`) or
//! read from a Jupyter connection file (`KernelConfig::from_file`). The TCP
//! transport fills in any port left at 0 when it binds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{KernelError, Result};

pub const DEFAULT_IP: &str = "0.0.0.0";
pub const DEFAULT_TRANSPORT: &str = "tcp";
pub const DEFAULT_SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Transport addressing for the five kernel channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub ip: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub control_port: u16,
    pub shell_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
}

fn default_transport() -> String {
    DEFAULT_TRANSPORT.to_string()
}

fn default_signature_scheme() -> String {
    DEFAULT_SIGNATURE_SCHEME.to_string()
}

impl KernelConfig {
    /// Config for `ip` with ports in control, shell, stdin, iopub, hb order
    /// and a freshly generated key; port 0 is resolved when the transport binds
    pub fn new(ip: &str, ports: [u16; 5]) -> Self {
        let [control_port, shell_port, stdin_port, iopub_port, hb_port] = ports;
        Self {
            ip: ip.to_string(),
            transport: default_transport(),
            control_port,
            shell_port,
            stdin_port,
            iopub_port,
            hb_port,
            key: uuid::Uuid::new_v4().to_string(),
            signature_scheme: default_signature_scheme(),
        }
    }

    /// Load a Jupyter connection file; a leading `~` is expanded to HOME
    pub fn from_file(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            KernelError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: KernelConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.transport != DEFAULT_TRANSPORT {
            return Err(KernelError::config(format!(
                "unsupported transport '{}'",
                self.transport
            )));
        }
        Ok(())
    }

    pub fn address(&self, port: u16) -> String {
        format!("{}:{}", self.ip, port)
    }
}

/// Resource limits of the TCP transport.
#[derive(Debug, Clone)]
pub struct TransportLimits {
    /// Longest accepted line; longer lines drop the connection.
    pub max_line_bytes: usize,

    /// Outgoing lines queued per connection. An iopub subscriber whose queue
    /// is full is dropped instead of stalling the kernel.
    pub outgoing_capacity: usize,

    /// Connections beyond this many per channel are refused.
    pub max_connections: usize,

    /// A connection that cannot take one line within this window is dropped.
    pub write_timeout: Duration,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 5 * 1024 * 1024,
            outgoing_capacity: 64,
            max_connections: 64,
            write_timeout: Duration::from_secs(10),
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home::home_dir() {
        Some(home) if !home.as_os_str().is_empty() => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn new_assigns_ports_in_channel_order_with_fresh_key() {
        let config = KernelConfig::new("127.0.0.1", [1, 2, 3, 4, 5]);
        assert_eq!(
            [
                config.control_port,
                config.shell_port,
                config.stdin_port,
                config.iopub_port,
                config.hb_port
            ],
            [1, 2, 3, 4, 5]
        );
        assert_eq!(config.transport, "tcp");
        assert_eq!(config.signature_scheme, "hmac-sha256");
        assert!(!config.key.is_empty());
        assert_ne!(KernelConfig::new("127.0.0.1", [0; 5]).key, config.key);
    }

    #[test]
    fn reads_connection_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ip": "127.0.0.1", "transport": "tcp", "control_port": 5001,
                "shell_port": 5002, "stdin_port": 5003, "iopub_port": 5004,
                "hb_port": 5005, "key": "abc", "signature_scheme": "hmac-sha256",
                "kernel_name": "python3"}}"#
        )
        .unwrap();

        let config = KernelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.shell_port, 5002);
        assert_eq!(config.key, "abc");
        assert_eq!(config.address(config.hb_port), "127.0.0.1:5005");
    }

    #[test]
    fn rejects_unknown_transport() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ip": "127.0.0.1", "transport": "ipc", "control_port": 1,
                "shell_port": 2, "stdin_port": 3, "iopub_port": 4, "hb_port": 5}}"#
        )
        .unwrap();

        let err = KernelConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = KernelConfig::from_file(Path::new("/nonexistent/kernel.json")).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }
}
