use crate::encoding::{Reader, Writer};
use crate::pdu::FunctionCode;
use crate::{DecodeError, EncodeError};
use core::fmt;

/// Exception codes a slave reports with the high bit of the function code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::SlaveDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::SlaveDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::SlaveDeviceFailure => f.write_str("slave device failure"),
            Self::Acknowledge => f.write_str("acknowledge"),
            Self::SlaveDeviceBusy => f.write_str("slave device busy"),
            Self::MemoryParityError => f.write_str("memory parity error"),
            Self::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            Self::GatewayTargetFailedToRespond => {
                f.write_str("gateway target device failed to respond")
            }
            Self::Unknown(raw) => write!(f, "unknown exception 0x{raw:02X}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExceptionResponse {
    /// Function code of the failed request, exception bit cleared.
    pub function_code: u8,
    pub exception_code: ExceptionCode,
}

impl ExceptionResponse {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(self.function_code | 0x80)?;
        w.write_u8(self.exception_code.as_u8())?;
        Ok(())
    }

    /// Decodes the single exception byte that follows `function_byte`.
    pub fn decode(function_byte: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if !FunctionCode::is_exception(function_byte) {
            return Err(DecodeError::InvalidFunctionCode(function_byte));
        }
        let code = r.read_u8()?;
        Ok(Self {
            function_code: FunctionCode::strip_exception(function_byte),
            exception_code: ExceptionCode::from_u8(code),
        })
    }
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (function 0x{:02X})",
            self.exception_code, self.function_code
        )
    }
}
