use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("invalid escape sequence 0x{0:02x} in frame")]
    BadEscape(u8),

    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("stream ended inside a frame")]
    Truncated,
}

impl ProtocolError {
    /// The stream itself failed, as opposed to a single bad message on an
    /// otherwise healthy stream.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Truncated)
    }
}
