//! Error types for the gattlink library
//!
//! This module defines the error taxonomy shared by the advertisement
//! decoder, the ATT request multiplexer and the GATT discovery engine.

use crate::att::AttErrorCode;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to a peripheral
#[derive(Error, Debug)]
pub enum Error {
    /// EIR blob truncated or internally inconsistent
    #[error("Malformed advertisement data at offset {offset}: {reason}")]
    MalformedAdvertisement { offset: usize, reason: &'static str },

    /// Discovery response record size outside the protocol-defined set
    #[error("Invalid record length {length} in response 0x{opcode:02X}")]
    InvalidRecordLength { opcode: u8, length: usize },

    #[error("Characteristic 0x{0:04X} has no client characteristic configuration descriptor")]
    NoCccd(u16),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Request 0x{request:02X} got a mismatched response 0x{response:02X}")]
    ProtocolMismatch { request: u8, response: u8 },

    #[error("Request 0x{opcode:02X} timed out after {timeout:?}")]
    RequestTimeout { opcode: u8, timeout: Duration },

    /// The peer answered with an ATT Error Response
    #[error("ATT error {code:?} for request 0x{request:02X} on handle 0x{handle:04X}")]
    Att {
        request: u8,
        handle: u16,
        code: AttErrorCode,
    },

    #[error("Invalid PDU: {0}")]
    InvalidPdu(&'static str),

    #[error("Characteristic 0x{declaration:04X}-0x{value:04X} lies outside every known service")]
    UnownedCharacteristic { declaration: u16, value: u16 },

    #[error("Discovery cursor did not advance (0x{previous:04X} -> 0x{next:04X})")]
    NonMonotonicHandle { previous: u16, next: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when this is a peer Error Response carrying "Attribute Not Found"
    pub fn is_attribute_not_found(&self) -> bool {
        matches!(
            self,
            Error::Att {
                code: AttErrorCode::AttributeNotFound,
                ..
            }
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// A discovery loop that stopped early.
///
/// `found` holds every entity discovered before the failure so the caller can
/// decide whether to retry the remaining handle range.
#[derive(Error, Debug)]
#[error("{source} ({} entities discovered before the failure)", .found.len())]
pub struct DiscoveryError<T: fmt::Debug> {
    pub found: Vec<T>,
    #[source]
    pub source: Error,
}

impl<T: fmt::Debug> DiscoveryError<T> {
    pub fn new(found: Vec<T>, source: Error) -> Self {
        Self { found, source }
    }

    /// Drop the partial results and keep the cause
    pub fn into_source(self) -> Error {
        self.source
    }
}

impl<T: fmt::Debug> From<DiscoveryError<T>> for Error {
    fn from(err: DiscoveryError<T>) -> Self {
        err.source
    }
}
