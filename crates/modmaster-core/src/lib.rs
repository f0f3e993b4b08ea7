//! Modbus TCP framing and register PDU codec in pure Rust.
//!
//! `modmaster-core` encodes master requests into MBAP frames and decodes
//! slave responses out of a byte stream that may hold partial or multiple
//! frames. Decoding is zero-copy and the crate builds without `std`.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(feature = "std")]
extern crate std;

pub mod encoding;
pub mod error;
pub mod frame;
pub mod pdu;

pub use error::{DecodeError, EncodeError, FrameError};
