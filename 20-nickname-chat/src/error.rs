use std::{io, net::SocketAddr};

/// Everything that can go wrong while serving chat sessions.
///
/// Only [`ChatError::Bind`] is meant to reach the operator. Every other
/// variant is handled inside the session that produced it, either by
/// replying to the peer or by ending that one session.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("nickname '{0}' is already in use")]
    DuplicateNickname(String),

    #[error("nickname '{0}' is not allowed")]
    InvalidNickname(String),

    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),

    #[error("no active session named '{0}'")]
    UnknownRecipient(String),

    #[error("cannot whisper to yourself")]
    SelfWhisper,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
