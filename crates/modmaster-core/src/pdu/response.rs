use crate::encoding::{be_register, Reader, Writer};
use crate::pdu::{ExceptionResponse, FunctionCode, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::{DecodeError, EncodeError};

/// Register bytes returned by a read holding registers (0x03) reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHoldingRegistersResponse<'a> {
    pub data: &'a [u8],
}

impl<'a> ReadHoldingRegistersResponse<'a> {
    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let byte_count = usize::from(r.read_u8()?);
        if byte_count == 0 || (byte_count % 2) != 0 {
            return Err(DecodeError::InvalidLength);
        }
        if byte_count > usize::from(MAX_READ_REGISTERS) * 2 {
            return Err(DecodeError::InvalidLength);
        }
        let data = r.read_exact(byte_count)?;
        Ok(Self { data })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.data.is_empty() || (self.data.len() % 2) != 0 {
            return Err(EncodeError::InvalidLength);
        }
        if self.data.len() > usize::from(MAX_READ_REGISTERS) * 2 {
            return Err(EncodeError::ValueOutOfRange);
        }
        let byte_count = u8::try_from(self.data.len()).map_err(|_| EncodeError::ValueOutOfRange)?;
        w.write_u8(FunctionCode::ReadHoldingRegisters.as_u8())?;
        w.write_u8(byte_count)?;
        w.write_all(self.data)?;
        Ok(())
    }

    pub fn register_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn register(&self, index: usize) -> Option<u16> {
        be_register(self.data, index)
    }

    pub fn registers(&self) -> impl Iterator<Item = u16> + 'a {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}

/// Echo of a successful write multiple registers (0x10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteMultipleRegistersResponse {
    pub start_address: u16,
    pub quantity: u16,
}

impl WriteMultipleRegistersResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let start_address = r.read_be_u16()?;
        let quantity = r.read_be_u16()?;
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            start_address,
            quantity,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.quantity == 0 || self.quantity > MAX_WRITE_REGISTERS {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(self.quantity)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    ReadHoldingRegisters(ReadHoldingRegistersResponse<'a>),
    WriteMultipleRegisters(WriteMultipleRegistersResponse),
    Exception(ExceptionResponse),
}

impl<'a> Response<'a> {
    /// Decodes one response PDU. Bytes after the PDU are left in `r`; the
    /// frame layer decides whether they are an error.
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function_byte = r.read_u8()?;
        if FunctionCode::is_exception(function_byte) {
            return Ok(Self::Exception(ExceptionResponse::decode(function_byte, r)?));
        }

        match FunctionCode::from_u8(function_byte)? {
            FunctionCode::ReadHoldingRegisters => Ok(Self::ReadHoldingRegisters(
                ReadHoldingRegistersResponse::decode_body(r)?,
            )),
            FunctionCode::WriteMultipleRegisters => Ok(Self::WriteMultipleRegisters(
                WriteMultipleRegistersResponse::decode_body(r)?,
            )),
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ReadHoldingRegisters(resp) => resp.encode(w),
            Self::WriteMultipleRegisters(resp) => resp.encode(w),
            Self::Exception(resp) => resp.encode(w),
        }
    }

    /// Function code of the request this answers, exception bit cleared.
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters.as_u8(),
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters.as_u8(),
            Self::Exception(ex) => ex.function_code,
        }
    }
}
