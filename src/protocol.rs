//! The wire protocol: framing, value codec, messages and command schemas.
//!
//! Every unit on the wire is a frame: a 4-byte big-endian payload length
//! followed by the payload, capped at 16 MiB. Payloads are maps encoded in a
//! MessagePack subset (see [`wire`]) and discriminated by a `"type"` field
//! (see [`message`]).

pub mod command;
pub mod message;
pub mod wire;

mod error;

use std::io::{Read, Write};

use byteorder::{NetworkEndian, WriteBytesExt};

pub use command::*;
pub use error::*;
pub use message::*;

/// Protocol version spoken by this library.
///
/// Peers advertising a higher version are treated as compatible; the
/// handshake acceptor always echoes this value.
pub const PROTOCOL_VERSION: u64 = 1;

/// Maximum frame payload length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one frame: the payload length as a big-endian u32, then the
/// payload. Short writes are absorbed; either the whole frame is written or
/// an error is returned.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(payload.len()));
    }
    w.write_u32::<NetworkEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one frame, failing with [`ProtocolError::Io`] on EOF.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    match read_frame_opt(r)? {
        Some(payload) => Ok(payload),
        None => Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        ))),
    }
}

/// Reads one frame, returning `None` on a clean EOF at a frame boundary.
///
/// EOF after the first length byte has been consumed is an error, as is a
/// declared length above the cap — checked before the payload buffer is
/// allocated. Interrupted reads are retried.
pub fn read_frame_opt<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut have = 0;
    while have < header.len() {
        match r.read(&mut header[have..]) {
            Ok(0) if have == 0 => return Ok(None),
            Ok(0) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside frame header",
                )))
            }
            Ok(n) => have += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Encodes and writes one message as a frame.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let payload = msg.encode()?;
    write_frame(w, &payload)
}

/// Reads and decodes one message.
pub fn read_message<R: Read>(r: &mut R) -> Result<Message, ProtocolError> {
    let payload = read_frame(r)?;
    Message::decode(&payload)
}

/// Reads and decodes one message, returning `None` on a clean EOF.
pub fn read_message_opt<R: Read>(r: &mut R) -> Result<Option<Message>, ProtocolError> {
    match read_frame_opt(r)? {
        Some(payload) => Ok(Some(Message::decode(&payload)?)),
        None => Ok(None),
    }
}
