//! Line-oriented text protocol spoken between the server and its peers.
//!
//! Every message in either direction is one UTF-8 line terminated by `\n`.
//! The handshake is a single line carrying the wanted nickname, answered by
//! exactly one of the two status tokens below. After that, each line is a chat message,
//! a `/w <nickname> <message>` whisper, `/who`, or the quit command.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChatError;

pub const NICKNAME_OK: &str = "NICKNAME_OK";
pub const DUPLICATE_NICKNAME: &str = "DUPLICATE_NICKNAME";

pub const WHISPER_COMMAND: &str = "/w";
pub const WHO_COMMAND: &str = "/who";
/// Always accepted next to the configured quit command.
pub const QUIT_ALIAS: &str = "/종료";

pub const MAX_NICKNAME_CHARS: usize = 32;
/// Upper bound accepted for the configured line length.
pub const MAX_LINE_BYTES_LIMIT: usize = 1 << 20;

pub const USAGE_NOTICE: &str = "[notice] usage: /w <nickname> <message>";
pub const SELF_WHISPER_NOTICE: &str = "[notice] cannot whisper to yourself";
pub const SHUTDOWN_NOTICE: &str = "[notice] server shutting down";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Text sent by an active peer, optionally addressed to one nickname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub text: &'a str,
    pub target: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Message(Message<'a>),
    Who,
    Quit,
}

/// Classifies one line received from an active peer.
pub fn parse_input<'a>(line: &'a str, quit_command: &str) -> Result<Inbound<'a>, ChatError> {
    if line == quit_command || line == QUIT_ALIAS {
        return Ok(Inbound::Quit);
    }
    if line == WHO_COMMAND {
        return Ok(Inbound::Who);
    }

    let Some(rest) = line.strip_prefix(WHISPER_COMMAND) else {
        return Ok(Inbound::Message(Message {
            text: line,
            target: None,
        }));
    };

    // "/wave" is ordinary chat; only "/w" followed by a space is a whisper.
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Ok(Inbound::Message(Message {
            text: line,
            target: None,
        }));
    }

    let rest = rest.trim_start();
    if rest.is_empty() {
        return Err(ChatError::MalformedCommand("missing whisper target"));
    }

    match rest.split_once(' ') {
        Some((target, text)) if !text.trim().is_empty() => Ok(Inbound::Message(Message {
            text: text.trim_start(),
            target: Some(target),
        })),
        _ => Err(ChatError::MalformedCommand("missing whisper message")),
    }
}

/// Trims a handshake candidate and checks it can be addressed by `/w`.
pub fn validate_nickname(candidate: &str) -> Result<&str, ChatError> {
    let nickname = candidate.trim();
    let acceptable = !nickname.is_empty()
        && nickname.chars().count() <= MAX_NICKNAME_CHARS
        && !nickname.starts_with('/')
        && !nickname.chars().any(char::is_whitespace);

    if acceptable {
        Ok(nickname)
    } else {
        Err(ChatError::InvalidNickname(nickname.to_string()))
    }
}

pub fn chat_line(nickname: &str, text: &str) -> String {
    format!("{nickname}> {text}")
}

pub fn joined_notice(nickname: &str) -> String {
    format!("{nickname} joined")
}

pub fn left_notice(nickname: &str) -> String {
    format!("{nickname} left")
}

pub fn whisper_from(sender: &str, text: &str) -> String {
    format!("[whisper from {sender}] {text}")
}

pub fn whisper_to(target: &str, text: &str) -> String {
    format!("[whisper to {target}] {text}")
}

pub fn not_found_notice(target: &str) -> String {
    format!("[notice] {target} not found")
}

pub fn roster_line(nicknames: &[String]) -> String {
    format!("[online] {}", nicknames.join(", "))
}

/// Reads the next non-blank line, without its line ending.
///
/// Returns `Ok(None)` on a clean EOF. A line longer than `max_bytes` or one
/// that is not valid UTF-8 is an error; the caller is expected to drop the
/// connection because the stream position is no longer trustworthy.
pub async fn read_line<R>(reader: &mut R, max_bytes: usize) -> Result<Option<String>, ChatError>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the longest accepted line plus "\r\n".
    let limit = (max_bytes as u64).saturating_add(2);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && buf.last() != Some(&b'\n') {
            return Err(ChatError::LineTooLong(max_bytes));
        }

        let line = String::from_utf8(std::mem::take(&mut buf))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.len() > max_bytes {
            return Err(ChatError::LineTooLong(max_bytes));
        }
        if trimmed.trim().is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

/// Writes `line` plus a newline and flushes, so the peer sees it as one unit.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
