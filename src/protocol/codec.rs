//! Message codec and stream framing.
//!
//! ## Encoding
//! Messages are serialised with bincode's varint options: enum tags (opcode,
//! status) take one byte and small integers stay small. Decoding is bounded by
//! [`MAX_FRAME_LEN`] and rejects trailing bytes, so malformed input always
//! comes back as an `Err`.
//!
//! ## Framing
//! Frames are terminated by [`FRAME_END`]. Payload bytes that collide with the
//! terminator or the escape byte are escaped SLIP-style:
//!
//! | payload byte | on the wire            |
//! | ------------ | ---------------------- |
//! | `0xC0`       | `0xDB 0xDC`            |
//! | `0xDB`       | `0xDB 0xDD`            |
//!
//! The terminator therefore never appears inside a frame, and a reader can
//! resynchronise after a bad frame by skipping to the next terminator.

use super::error::ProtocolError;
use super::types::Msg;

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub const FRAME_END: u8 = 0xC0;
pub const FRAME_ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Upper bound on a single frame, before unescaping.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit as u64)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    encode_with_limit(value, MAX_FRAME_LEN)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    decode_with_limit(bytes, MAX_FRAME_LEN)
}

pub fn encode_with_limit<T: Serialize>(value: &T, limit: usize) -> Result<Vec<u8>, ProtocolError> {
    options(limit).serialize(value).map_err(ProtocolError::Encode)
}

pub fn decode_with_limit<T: DeserializeOwned>(
    bytes: &[u8],
    limit: usize,
) -> Result<T, ProtocolError> {
    options(limit).deserialize(bytes).map_err(ProtocolError::Decode)
}

/// Encoded size of `value` under the same options, without allocating.
pub fn encoded_len<T: Serialize>(value: &T) -> Result<u64, ProtocolError> {
    bincode::DefaultOptions::new()
        .serialized_size(value)
        .map_err(ProtocolError::Encode)
}

pub fn encode_msg(msg: &Msg) -> Result<Vec<u8>, ProtocolError> {
    encode(msg)
}

pub fn decode_msg(bytes: &[u8]) -> Result<Msg, ProtocolError> {
    decode(bytes)
}

/// Escapes `payload` and appends the terminator.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    for &byte in payload {
        match byte {
            FRAME_END => out.extend_from_slice(&[FRAME_ESC, ESC_END]),
            FRAME_ESC => out.extend_from_slice(&[FRAME_ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(FRAME_END);
    out
}

/// Reverses [`frame`] for the bytes between two terminators.
pub fn unframe(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&byte) = bytes.next() {
        if byte != FRAME_ESC {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(&ESC_END) => out.push(FRAME_END),
            Some(&ESC_ESC) => out.push(FRAME_ESC),
            Some(&other) => return Err(ProtocolError::BadEscape(other)),
            None => return Err(ProtocolError::BadEscape(FRAME_ESC)),
        }
    }
    Ok(out)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_msg<W>(writer: &mut W, msg: &Msg) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_msg(msg)?;
    write_frame(writer, &payload).await
}

/// Splits a byte stream into whole frames, in order.
///
/// `read_frame` is cancel-safe: bytes are only consumed from the inner buffer
/// after they have been moved into the pending frame.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    discarding: bool,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_FRAME_LEN)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
            discarding: false,
            max_len,
        }
    }

    /// Next unescaped frame, or `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() || self.discarding {
                    self.pending.clear();
                    return Ok(None);
                }
                self.pending.clear();
                return Err(ProtocolError::Truncated);
            }

            match available.iter().position(|&b| b == FRAME_END) {
                Some(pos) => {
                    if !self.discarding {
                        self.pending.extend_from_slice(&available[..pos]);
                    }
                    self.inner.consume(pos + 1);

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if self.pending.len() > self.max_len {
                        self.pending.clear();
                        return Err(ProtocolError::FrameTooLarge(self.max_len));
                    }
                    let raw = std::mem::take(&mut self.pending);
                    if raw.is_empty() {
                        continue;
                    }
                    return unframe(&raw).map(Some);
                }
                None => {
                    let len = available.len();
                    if !self.discarding {
                        self.pending.extend_from_slice(available);
                    }
                    self.inner.consume(len);

                    if !self.discarding && self.pending.len() > self.max_len {
                        self.pending.clear();
                        self.discarding = true;
                        return Err(ProtocolError::FrameTooLarge(self.max_len));
                    }
                }
            }
        }
    }

    pub async fn read_msg(&mut self) -> Result<Option<Msg>, ProtocolError> {
        match self.read_frame().await? {
            Some(payload) => decode_msg(&payload).map(Some),
            None => Ok(None),
        }
    }
}
