use crate::DecodeError;

const EXCEPTION_BIT: u8 = 0x80;

/// Function codes the master engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => 0x03,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    /// Anything outside the supported set, including exception-flagged
    /// bytes, is rejected.
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x10 => Ok(Self::WriteMultipleRegisters),
            other => Err(DecodeError::InvalidFunctionCode(other)),
        }
    }

    pub const fn is_exception(value: u8) -> bool {
        (value & EXCEPTION_BIT) != 0
    }

    pub const fn exception_byte(self) -> u8 {
        self.as_u8() | EXCEPTION_BIT
    }

    pub const fn strip_exception(value: u8) -> u8 {
        value & !EXCEPTION_BIT
    }
}
