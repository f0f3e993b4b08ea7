pub mod exception;
pub mod function_code;
pub mod request;
pub mod response;

pub use exception::{ExceptionCode, ExceptionResponse};
pub use function_code::FunctionCode;
pub use request::*;
pub use response::*;

/// Largest PDU (function code + payload) an MBAP frame can carry.
pub const MAX_PDU_LEN: usize = 253;
/// Register limit for one read holding registers request (0x03).
pub const MAX_READ_REGISTERS: u16 = 125;
/// Register limit for one write multiple registers request (0x10).
pub const MAX_WRITE_REGISTERS: u16 = 123;
