use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::config::{DEFAULT_MAX_LINE_BYTES, DEFAULT_QUIT_COMMAND, ServerConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-client chat server with nicknames and whispers", long_about = None)]
pub struct Cli {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9999")]
    pub listen: SocketAddr,

    /// Line a client sends to leave the chat.
    #[arg(long, default_value = DEFAULT_QUIT_COMMAND)]
    pub quit_command: String,

    /// Longest line, in bytes, accepted from a client.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Milliseconds a write to one client may take before that client is dropped.
    #[arg(long, default_value_t = 5_000)]
    pub write_timeout_ms: u64,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            quit_command: self.quit_command,
            max_line_bytes: self.max_line_bytes,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}
