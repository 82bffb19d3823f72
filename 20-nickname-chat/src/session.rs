//! Per-connection state and the task that drives it.
//!
//! A session moves through `Connecting → NegotiatingNickname → Active →
//! Closing → Closed`. The task reading from the peer owns the transitions up
//! to `Active` and performs the final teardown. Anyone else (the router after
//! a failed write, the server on shutdown) may only request `Closing`, which
//! wakes the reading task so it tears itself down.

use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, Notify},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    error::ChatError,
    protocol::{self, Inbound, Message},
    registry::SessionRegistry,
    router::MessageRouter,
};

pub type SessionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    NegotiatingNickname = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::NegotiatingNickname,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One connected peer.
///
/// Shared as `Arc<Session>` between the task serving the peer and the
/// registry. The write half sits behind its own async mutex so a line is
/// always written to the peer as one piece.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    nickname: OnceLock<String>,
    state: AtomicU8,
    writer: Mutex<BoxedWriter>,
    close_requested: Notify,
    write_timeout: Duration,
}

impl Session {
    pub fn new<W>(id: SessionId, peer: Option<SocketAddr>, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            nickname: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            writer: Mutex::new(Box::new(writer)),
            close_requested: Notify::new(),
            write_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The claimed nickname, once the handshake has succeeded.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leaves `Connecting` once the connection is being served.
    pub(crate) fn start_negotiating(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::NegotiatingNickname)
    }

    /// Moves a negotiating session to `Active` under `nickname`.
    ///
    /// Only called by the registry while it holds its lock, which is what
    /// makes the nickname check and this transition a single step.
    pub(crate) fn activate(&self, nickname: &str) -> bool {
        if !self.transition(SessionState::NegotiatingNickname, SessionState::Active) {
            return false;
        }
        let _ = self.nickname.set(nickname.to_string());
        true
    }

    /// Requests teardown. Returns `true` for the one call that actually moved
    /// the session into `Closing`.
    pub fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.close_requested.notify_one();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Writes one line to the peer, bounded by the configured write timeout.
    pub async fn send(&self, line: &str) -> Result<(), ChatError> {
        if self.state() == SessionState::Closed {
            return Err(ChatError::PeerDisconnected);
        }
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, line).await
    }

    async fn write_locked(&self, writer: &mut BoxedWriter, line: &str) -> Result<(), ChatError> {
        match timeout(self.write_timeout, protocol::write_line(writer, line)).await {
            Ok(result) => result.map_err(ChatError::from),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out").into()),
        }
    }

    /// Registers `nickname` and confirms it to the peer as one step.
    ///
    /// The writer lock is held across registration so that `NICKNAME_OK` is
    /// always the first line a newly active peer receives, ahead of any
    /// broadcast that already sees it in the registry.
    async fn claim_nickname(
        self: &Arc<Self>,
        registry: &SessionRegistry,
        nickname: &str,
    ) -> Result<(), ChatError> {
        let mut writer = self.writer.lock().await;
        if !registry.register(self, nickname) {
            if self.state() >= SessionState::Closing {
                return Err(ChatError::PeerDisconnected);
            }
            return Err(ChatError::DuplicateNickname(nickname.to_string()));
        }

        if let Err(err) = self.write_locked(&mut writer, protocol::NICKNAME_OK).await {
            // Never announced, so leave without a departure notice.
            registry.unregister(self);
            return Err(err);
        }
        Ok(())
    }

    /// Closes the write half. The read half is released when the session task ends.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(session = self.id, error = ?err, "failed to shut down writer");
        }
    }

    async fn close_requested(&self) {
        self.close_requested.notified().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("nickname", &self.nickname())
            .field("state", &self.state())
            .finish()
    }
}

enum Handshake {
    Joined,
    Abandoned,
}

/// Serves one peer from accept to teardown.
///
/// Errors returned here have already been contained: the session is closed
/// and unregistered before this function returns, whatever the outcome.
pub async fn run_session<R>(
    session: Arc<Session>,
    mut reader: R,
    router: MessageRouter,
    config: Arc<ServerConfig>,
) -> Result<(), ChatError>
where
    R: AsyncBufRead + Unpin,
{
    session.start_negotiating();

    let outcome = match negotiate_nickname(&session, &mut reader, &router, &config).await {
        Ok(Handshake::Joined) => {
            let nickname = session.nickname().unwrap_or_default();
            info!(session = session.id(), peer = ?session.peer(), nickname, "client joined");
            router
                .broadcast(&protocol::joined_notice(nickname), Some(session.as_ref()))
                .await;
            run_active(&session, &mut reader, &router, &config).await
        }
        Ok(Handshake::Abandoned) => {
            debug!(session = session.id(), "peer left during handshake");
            Ok(())
        }
        Err(err) => Err(err),
    };

    router.disconnect(&session).await;
    outcome
}

async fn negotiate_nickname<R>(
    session: &Arc<Session>,
    reader: &mut R,
    router: &MessageRouter,
    config: &ServerConfig,
) -> Result<Handshake, ChatError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(candidate) = next_line(session, reader, config.max_line_bytes).await? else {
            return Ok(Handshake::Abandoned);
        };

        let claimed = match protocol::validate_nickname(&candidate) {
            Ok(nickname) => session.claim_nickname(router.registry(), nickname).await,
            Err(err) => Err(err),
        };

        let reply = match claimed {
            Ok(()) => return Ok(Handshake::Joined),
            Err(ChatError::DuplicateNickname(nickname)) => {
                debug!(session = session.id(), %nickname, "nickname taken");
                protocol::DUPLICATE_NICKNAME
            }
            // Unusable names get the same refusal as taken ones; the client retries.
            Err(ChatError::InvalidNickname(nickname)) => {
                debug!(session = session.id(), %nickname, "nickname rejected");
                protocol::DUPLICATE_NICKNAME
            }
            Err(err) => return Err(err),
        };
        session.send(reply).await?;
    }
}

async fn run_active<R>(
    session: &Arc<Session>,
    reader: &mut R,
    router: &MessageRouter,
    config: &ServerConfig,
) -> Result<(), ChatError>
where
    R: AsyncBufRead + Unpin,
{
    let nickname = session.nickname().unwrap_or_default();

    while let Some(line) = next_line(session, reader, config.max_line_bytes).await? {
        match protocol::parse_input(&line, &config.quit_command) {
            Ok(Inbound::Quit) => {
                debug!(session = session.id(), nickname, "client sent quit");
                break;
            }
            Ok(Inbound::Who) => router.send_roster(session).await,
            Ok(Inbound::Message(Message { text, target: None })) => {
                debug!(session = session.id(), nickname, "broadcast");
                router
                    .broadcast(&protocol::chat_line(nickname, text), Some(session.as_ref()))
                    .await;
            }
            Ok(Inbound::Message(Message {
                text,
                target: Some(target),
            })) => router.whisper(session, target, text).await,
            Err(err) => {
                debug!(session = session.id(), error = %err, "malformed command");
                router.reply(session, protocol::USAGE_NOTICE).await;
            }
        }
    }

    Ok(())
}

/// Next line from the peer, or `None` once the peer is gone or someone asked
/// this session to close.
async fn next_line<R>(
    session: &Session,
    reader: &mut R,
    max_line_bytes: usize,
) -> Result<Option<String>, ChatError>
where
    R: AsyncBufRead + Unpin,
{
    if session.state() >= SessionState::Closing {
        return Ok(None);
    }

    select! {
        biased;
        _ = session.close_requested() => Ok(None),
        line = protocol::read_line(reader, max_line_bytes) => line,
    }
}
