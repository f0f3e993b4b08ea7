use crate::encoding::{be_register, Reader, Writer};
use crate::pdu::{FunctionCode, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::{DecodeError, EncodeError};

fn validate_quantity(quantity: u16, max: u16) -> Result<(), EncodeError> {
    if quantity == 0 || quantity > max {
        return Err(EncodeError::ValueOutOfRange);
    }
    Ok(())
}

fn validate_quantity_decode(quantity: u16, max: u16) -> Result<(), DecodeError> {
    if quantity == 0 || quantity > max {
        return Err(DecodeError::InvalidValue);
    }
    Ok(())
}

/// Read holding registers (0x03): address + quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadHoldingRegistersRequest {
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadHoldingRegistersRequest {
    pub fn validate(&self) -> Result<(), EncodeError> {
        validate_quantity(self.quantity, MAX_READ_REGISTERS)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        self.validate()?;
        w.write_u8(FunctionCode::ReadHoldingRegisters.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(self.quantity)?;
        Ok(())
    }
}

/// Write multiple registers (0x10): address, quantity, byte count, values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequest<'a> {
    pub start_address: u16,
    pub values: &'a [u16],
}

impl<'a> WriteMultipleRegistersRequest<'a> {
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        let quantity = u16::try_from(self.values.len()).map_err(|_| EncodeError::ValueOutOfRange)?;
        validate_quantity(quantity, MAX_WRITE_REGISTERS)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = self.quantity()?;
        // 123 registers at most, so the byte count always fits in a u8.
        let byte_count = u8::try_from(self.values.len() * 2).map_err(|_| EncodeError::ValueOutOfRange)?;

        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(quantity)?;
        w.write_u8(byte_count)?;
        w.write_registers(self.values)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    ReadHoldingRegisters(ReadHoldingRegistersRequest),
    WriteMultipleRegisters(WriteMultipleRegistersRequest<'a>),
}

impl<'a> Request<'a> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ReadHoldingRegisters(req) => req.encode(w),
            Self::WriteMultipleRegisters(req) => req.encode(w),
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn start_address(&self) -> u16 {
        match self {
            Self::ReadHoldingRegisters(req) => req.start_address,
            Self::WriteMultipleRegisters(req) => req.start_address,
        }
    }

    /// Number of registers read or written.
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        match self {
            Self::ReadHoldingRegisters(req) => {
                req.validate()?;
                Ok(req.quantity)
            }
            Self::WriteMultipleRegisters(req) => req.quantity(),
        }
    }
}

/// Borrowed view of a decoded 0x10 request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequestData<'a> {
    pub start_address: u16,
    pub values_bytes: &'a [u8],
}

impl<'a> WriteMultipleRegistersRequestData<'a> {
    pub fn quantity(&self) -> usize {
        self.values_bytes.len() / 2
    }

    pub fn register(&self, index: usize) -> Option<u16> {
        be_register(self.values_bytes, index)
    }
}

/// Request PDU as seen from the slave side. Test slaves and simulators use
/// this to answer what the master sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedRequest<'a> {
    ReadHoldingRegisters(ReadHoldingRegistersRequest),
    WriteMultipleRegisters(WriteMultipleRegistersRequestData<'a>),
}

impl<'a> DecodedRequest<'a> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function = FunctionCode::from_u8(r.read_u8()?)?;
        let start_address = r.read_be_u16()?;
        let quantity = r.read_be_u16()?;
        match function {
            FunctionCode::ReadHoldingRegisters => {
                validate_quantity_decode(quantity, MAX_READ_REGISTERS)?;
                Ok(Self::ReadHoldingRegisters(ReadHoldingRegistersRequest {
                    start_address,
                    quantity,
                }))
            }
            FunctionCode::WriteMultipleRegisters => {
                validate_quantity_decode(quantity, MAX_WRITE_REGISTERS)?;
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != usize::from(quantity) * 2 {
                    return Err(DecodeError::InvalidLength);
                }
                let values_bytes = r.read_exact(byte_count)?;
                Ok(Self::WriteMultipleRegisters(WriteMultipleRegistersRequestData {
                    start_address,
                    values_bytes,
                }))
            }
        }
    }
}
