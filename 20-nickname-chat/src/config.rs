use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Result, ensure};

use crate::protocol::MAX_LINE_BYTES_LIMIT;

pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_QUIT_COMMAND: &str = "/quit";
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for a chat server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listening socket binds to. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Line that ends a session cleanly when sent by an active peer.
    pub quit_command: String,
    /// Longest inbound line accepted, newline excluded.
    pub max_line_bytes: usize,
    /// Upper bound on a single write to one peer before it counts as failed.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            quit_command: DEFAULT_QUIT_COMMAND.to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Config bound to an ephemeral loopback port, for tests and tooling.
    pub fn ephemeral() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.quit_command.trim().is_empty(),
            "quit command cannot be empty"
        );
        ensure!(
            self.quit_command.starts_with('/'),
            "quit command must start with '/'"
        );
        ensure!(self.max_line_bytes > 0, "max line length must be positive");
        ensure!(
            self.max_line_bytes <= MAX_LINE_BYTES_LIMIT,
            "max line length cannot exceed {MAX_LINE_BYTES_LIMIT} bytes"
        );
        ensure!(
            !self.write_timeout.is_zero(),
            "write timeout must be positive"
        );
        Ok(())
    }
}
