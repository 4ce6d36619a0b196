//! Wire format shared by the engine and the wrapper
//!
//! Every control-plane message travels as one frame: a 4-byte big-endian body
//! length followed by a JSON body tagged by `"type"`. Data channels send a single
//! `hello` frame and carry raw bytes afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::token::{ChannelTokens, SecurityToken};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge { len: usize },

    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("invalid launch request: {reason}")]
    InvalidLaunchRequest { reason: String },

    #[error("I/O error on control connection: {0}")]
    Io(#[from] io::Error),
}

/// The four connections a wrapper opens back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Control,
    Stdin,
    Stdout,
    Stderr,
}

impl Channel {
    pub const ALL: [Self; 4] = [Self::Control, Self::Stdin, Self::Stdout, Self::Stderr];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the wrapped child terminated, as reported in an `exit` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireExit {
    Code(i32),
    Signal(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// First frame on every connection (wrapper → engine).
    Hello {
        channel: Channel,
        token: SecurityToken,
    },
    /// Real pid of the wrapped child (wrapper → engine).
    Pid { pid: u32 },
    /// The wrapper could not start the target (wrapper → engine).
    Error { reason: String },
    /// Deliver a signal to the wrapped child (engine → wrapper).
    Signal { signal: i32 },
    /// Terminal message; the wrapper exits after sending it (wrapper → engine).
    Exit { status: WireExit },
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Pid { .. } => "pid",
            Self::Error { .. } => "error",
            Self::Signal { .. } => "signal",
            Self::Exit { .. } => "exit",
        }
    }
}

/// Encode `message` as a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len: body.len() });
    }
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge { len: body.len() })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while `buf` holds only part of a frame, otherwise the message
/// and the number of bytes it occupied.
pub(crate) fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let len = body_len(header)?;
    let Some(body) = buf.get(HEADER_LEN..HEADER_LEN + len) else {
        return Ok(None);
    };
    Ok(Some((parse_body(body)?, HEADER_LEN + len)))
}

fn body_len(header: &[u8]) -> Result<usize, ProtocolError> {
    let mut bytes = [0u8; HEADER_LEN];
    bytes.copy_from_slice(header);
    let len = u32::from_be_bytes(bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    Ok(len)
}

fn parse_body(body: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}

pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame.
///
/// `Ok(None)` means the peer closed the connection cleanly between frames. Only
/// the bytes of the frame are consumed, so a data channel can switch to raw bytes
/// right after its `hello`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Malformed {
                reason: "connection closed inside a frame header".to_string(),
            });
        }
        filled += n;
    }

    let len = body_len(&header)?;
    let mut frame = vec![0u8; HEADER_LEN + len];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[HEADER_LEN..])
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Malformed {
                reason: format!("connection closed inside a {len}-byte frame body"),
            },
            _ => ProtocolError::Io(e),
        })?;
    match decode(&frame)? {
        Some((message, _)) => Ok(Some(message)),
        None => Err(ProtocolError::Malformed {
            reason: format!("short {len}-byte frame"),
        }),
    }
}

/// What the wrapper should run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Sent by the engine as a single JSON line on the wrapper's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchRequest {
    pub address: SocketAddr,
    pub tokens: ChannelTokens,
    pub command: LaunchCommand,
}

impl LaunchRequest {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self).map_err(|e| ProtocolError::InvalidLaunchRequest {
            reason: e.to_string(),
        })?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let request: Self =
            serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidLaunchRequest {
                reason: e.to_string(),
            })?;
        if request.command.program.is_empty() {
            return Err(ProtocolError::InvalidLaunchRequest {
                reason: "command.program is empty".to_string(),
            });
        }
        Ok(request)
    }

    /// Read the request line from the wrapper's stdin.
    pub fn read_from(mut reader: impl BufRead) -> Result<Self, ProtocolError> {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(ProtocolError::InvalidLaunchRequest {
                reason: "stdin closed before a launch request arrived".to_string(),
            });
        }
        Self::from_line(&line)
    }

    #[must_use]
    pub fn token_for(&self, channel: Channel) -> &SecurityToken {
        self.tokens.get(channel)
    }
}
