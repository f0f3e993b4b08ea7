use core::fmt;

/// Errors that can occur while encoding Modbus data into an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncodeError {
    BufferTooSmall,
    ValueOutOfRange,
    InvalidLength,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => f.write_str("buffer too small"),
            Self::ValueOutOfRange => f.write_str("value out of range"),
            Self::InvalidLength => f.write_str("invalid length"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

/// Errors that can occur while decoding Modbus data from an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeError {
    UnexpectedEof,
    InvalidProtocolId(u16),
    InvalidFunctionCode(u8),
    InvalidLength,
    InvalidValue,
    TrailingBytes(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => f.write_str("unexpected end of input"),
            Self::InvalidProtocolId(id) => write!(f, "invalid protocol id {id}"),
            Self::InvalidFunctionCode(code) => write!(f, "invalid function code 0x{code:02X}"),
            Self::InvalidLength => f.write_str("invalid length"),
            Self::InvalidValue => f.write_str("invalid value"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing byte(s) after pdu"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Outcome of trying to cut one MBAP frame out of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameError {
    /// The buffer does not yet hold a whole frame. Keep the bytes and retry
    /// once more have arrived.
    Incomplete,
    /// The buffer holds a frame that can never be valid. The stream is out
    /// of sync and must not be reused.
    Malformed(DecodeError),
}

impl FrameError {
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }
}

impl From<DecodeError> for FrameError {
    fn from(err: DecodeError) -> Self {
        Self::Malformed(err)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => f.write_str("incomplete frame"),
            Self::Malformed(err) => write!(f, "malformed frame: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FrameError {}
