//! The startup directive line read by launching frontends.

use serde::Serialize;
use std::io::Write;

use crate::kernel::KernelConfig;

#[derive(Debug, Serialize)]
struct Directives<'a> {
    ip: &'a str,
    transport: &'a str,
    control_port: u16,
    shell_port: u16,
    stdin_port: u16,
    iopub_port: u16,
    hb_port: u16,
    key: &'a str,
    signature_scheme: &'a str,
}

impl<'a> From<&'a KernelConfig> for Directives<'a> {
    fn from(config: &'a KernelConfig) -> Self {
        Self {
            ip: &config.ip,
            transport: &config.transport,
            control_port: config.control_port,
            shell_port: config.shell_port,
            stdin_port: config.stdin_port,
            iopub_port: config.iopub_port,
            hb_port: config.hb_port,
            key: &config.key,
            signature_scheme: &config.signature_scheme,
        }
    }
}

/// Write the configuration as one JSON line and flush
pub fn print_directives<W: Write>(config: &KernelConfig, out: &mut W) -> std::io::Result<()> {
    let line = serde_json::to_string(&Directives::from(config))?;
    writeln!(out, "{}", line)?;
    out.flush()
}
