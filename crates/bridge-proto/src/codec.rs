//! Length-prefixed framing over any byte stream.
//!
//! Frame layout: `[4-byte magic][u16 LE command][u64 LE payload length][payload]`.
//! The magic lets the reader reject noise without consuming past the header.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol identifier at the start of every frame.
pub const MAGIC: [u8; 4] = *b"bmux";

/// Magic + command + payload length.
pub const HEADER_LEN: usize = 14;

/// Upper bound on a single payload. Larger lengths are rejected before any
/// allocation happens.
pub const MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error on wire: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(u64),

    #[error("expected command {expected:?}, received {received:?}")]
    WrongCommand { expected: Command, received: Command },

    #[error("error decoding payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame dispatch tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Not a real frame: either noise on the wire or a tag this side does not
    /// understand.
    Unknown = 0,
    Control = 1,
    Events = 2,
    Proxy = 3,
    RevProxyListen = 4,
    RevProxyWork = 5,
}

impl Command {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            1 => Command::Control,
            2 => Command::Events,
            3 => Command::Proxy,
            4 => Command::RevProxyListen,
            5 => Command::RevProxyWork,
            _ => Command::Unknown,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Unknown => "unknown",
            Command::Control => "control",
            Command::Events => "events",
            Command::Proxy => "proxy",
            Command::RevProxyListen => "rev-proxy-listen",
            Command::RevProxyWork => "rev-proxy-work",
        };
        f.write_str(name)
    }
}

/// Write one frame: header then payload.
pub async fn write_frame<W>(writer: &mut W, cmd: Command, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len() as u64));
    }

    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_slice(&MAGIC);
    header.put_u16_le(cmd.as_u16());
    header.put_u64_le(payload.len() as u64);

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read the next frame.
///
/// A header whose magic does not match yields `(Command::Unknown, empty)`
/// without reading any further bytes, so the caller can drop the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Command, Vec<u8>), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if header[..4] != MAGIC {
        return Ok((Command::Unknown, Vec::new()));
    }

    let cmd = Command::from_u16(u16::from_le_bytes([header[4], header[5]]));

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[6..14]);
    let len = u64::from_le_bytes(len_bytes);

    if len > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok((cmd, payload))
}

/// Marshal `value` as JSON and write it under `cmd`.
pub async fn write_json<W, T>(writer: &mut W, cmd: Command, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, cmd, &payload).await
}

/// Read a frame that must carry `expect` and decode its JSON payload.
pub async fn read_json<R, T>(reader: &mut R, expect: Command) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let (cmd, payload) = read_frame(reader).await?;
    if cmd != expect {
        return Err(CodecError::WrongCommand {
            expected: expect,
            received: cmd,
        });
    }

    Ok(serde_json::from_slice(&payload)?)
}

/// Write an empty acknowledgement frame for `cmd`.
pub async fn write_ack<W>(writer: &mut W, cmd: Command) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, cmd, &[]).await
}

/// Read a frame that must be an acknowledgement for `cmd`. The payload is
/// discarded.
pub async fn read_ack<R>(reader: &mut R, expect: Command) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let (cmd, _) = read_frame(reader).await?;
    if cmd != expect {
        return Err(CodecError::WrongCommand {
            expected: expect,
            received: cmd,
        });
    }

    Ok(())
}
