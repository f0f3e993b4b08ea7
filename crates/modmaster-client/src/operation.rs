//! Owned register operations as they travel from a caller to the engine.

use crate::ClientError;
use modmaster_core::pdu::{
    FunctionCode, ReadHoldingRegistersRequest, Request, WriteMultipleRegistersRequest,
    MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRequest {
    ReadHoldingRegisters { start_address: u16, quantity: u16 },
    WriteMultipleRegisters { start_address: u16, values: Vec<u16> },
}

impl RegisterRequest {
    pub fn read_holding_registers(start_address: u16, quantity: u16) -> Result<Self, ClientError> {
        let request = Self::ReadHoldingRegisters {
            start_address,
            quantity,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn write_multiple_registers(start_address: u16, values: &[u16]) -> Result<Self, ClientError> {
        let request = Self::WriteMultipleRegisters {
            start_address,
            values: values.to_vec(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Checks quantity limits and address-space overflow.
    pub fn validate(&self) -> Result<(), ClientError> {
        match self {
            Self::ReadHoldingRegisters { quantity, .. } => {
                if *quantity == 0 || *quantity > MAX_READ_REGISTERS {
                    return Err(ClientError::InvalidArgument(
                        "read quantity must be between 1 and 125",
                    ));
                }
            }
            Self::WriteMultipleRegisters { values, .. } => {
                if values.is_empty() || values.len() > usize::from(MAX_WRITE_REGISTERS) {
                    return Err(ClientError::InvalidArgument(
                        "write must carry between 1 and 123 registers",
                    ));
                }
            }
        }
        let last = u32::from(self.start_address()) + u32::from(self.quantity()) - 1;
        if last > u32::from(u16::MAX) {
            return Err(ClientError::InvalidArgument(
                "register range runs past address 65535",
            ));
        }
        Ok(())
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn start_address(&self) -> u16 {
        match self {
            Self::ReadHoldingRegisters { start_address, .. }
            | Self::WriteMultipleRegisters { start_address, .. } => *start_address,
        }
    }

    /// Register count. Writes longer than `u16::MAX` saturate and fail
    /// [`validate`](Self::validate).
    pub fn quantity(&self) -> u16 {
        match self {
            Self::ReadHoldingRegisters { quantity, .. } => *quantity,
            Self::WriteMultipleRegisters { values, .. } => {
                u16::try_from(values.len()).unwrap_or(u16::MAX)
            }
        }
    }

    pub(crate) fn as_pdu(&self) -> Request<'_> {
        match self {
            Self::ReadHoldingRegisters {
                start_address,
                quantity,
            } => Request::ReadHoldingRegisters(ReadHoldingRegistersRequest {
                start_address: *start_address,
                quantity: *quantity,
            }),
            Self::WriteMultipleRegisters {
                start_address,
                values,
            } => Request::WriteMultipleRegisters(WriteMultipleRegistersRequest {
                start_address: *start_address,
                values,
            }),
        }
    }
}

/// A slave's acknowledgement of a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub start_address: u16,
    pub quantity: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    Registers(Vec<u16>),
    Written(WriteAck),
}
