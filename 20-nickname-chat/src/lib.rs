//! Multi-client chat server with unique nicknames and private whispers.
//!
//! Clients connect over TCP, claim a nickname, then exchange broadcast and
//! `/w` whisper messages through a shared router. Each module owns one
//! concern:
//!
//! - [`server`] accepts connections and spawns one task per client.
//! - [`session`] runs the per-connection state machine: handshake, message
//!   loop, teardown.
//! - [`registry`] maps nicknames to active sessions behind a single mutex.
//! - [`router`] delivers broadcasts and whispers using registry snapshots,
//!   so no socket write ever happens while the registry is locked.
//! - [`protocol`] defines the line framing, status tokens and notices.
//! - [`config`] and [`cli`] hold process configuration; [`error`] the error
//!   taxonomy shared by all of the above.

pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
