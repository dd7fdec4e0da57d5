//! Type definitions for the ATT protocol
//!
//! Outgoing PDUs implement [`AttPacket`]; incoming PDUs are parsed by the
//! `parse` constructors on the response types. Handles are little-endian on
//! the wire.
use super::constants::*;
use super::error::AttErrorCode;
use crate::error::{Error, Result};
use crate::uuid::Uuid;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// The ATT opcodes this client sends or understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ErrorResponse,
    ExchangeMtuRequest,
    ExchangeMtuResponse,
    FindInformationRequest,
    FindInformationResponse,
    ReadByTypeRequest,
    ReadByTypeResponse,
    ReadRequest,
    ReadResponse,
    ReadBlobRequest,
    ReadBlobResponse,
    ReadByGroupTypeRequest,
    ReadByGroupTypeResponse,
    WriteRequest,
    WriteResponse,
    HandleValueNotification,
    HandleValueIndication,
    HandleValueConfirmation,
    WriteCommand,
}

/// Request opcode to its single success-response opcode.
const RESPONSE_FOR: [(Opcode, Opcode); 7] = [
    (Opcode::ExchangeMtuRequest, Opcode::ExchangeMtuResponse),
    (Opcode::FindInformationRequest, Opcode::FindInformationResponse),
    (Opcode::ReadByTypeRequest, Opcode::ReadByTypeResponse),
    (Opcode::ReadRequest, Opcode::ReadResponse),
    (Opcode::ReadBlobRequest, Opcode::ReadBlobResponse),
    (Opcode::ReadByGroupTypeRequest, Opcode::ReadByGroupTypeResponse),
    (Opcode::WriteRequest, Opcode::WriteResponse),
];

impl Opcode {
    /// The response a server sends on success, `None` for anything that is
    /// not a request.
    pub fn expected_response(self) -> Option<Opcode> {
        RESPONSE_FOR
            .iter()
            .find(|(request, _)| *request == self)
            .map(|(_, response)| *response)
    }

    /// True for opcodes that open a request/response transaction
    pub fn is_request(self) -> bool {
        self.expected_response().is_some()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        let opcode = match value {
            ATT_ERROR_RSP => Opcode::ErrorResponse,
            ATT_EXCHANGE_MTU_REQ => Opcode::ExchangeMtuRequest,
            ATT_EXCHANGE_MTU_RSP => Opcode::ExchangeMtuResponse,
            ATT_FIND_INFO_REQ => Opcode::FindInformationRequest,
            ATT_FIND_INFO_RSP => Opcode::FindInformationResponse,
            ATT_READ_BY_TYPE_REQ => Opcode::ReadByTypeRequest,
            ATT_READ_BY_TYPE_RSP => Opcode::ReadByTypeResponse,
            ATT_READ_REQ => Opcode::ReadRequest,
            ATT_READ_RSP => Opcode::ReadResponse,
            ATT_READ_BLOB_REQ => Opcode::ReadBlobRequest,
            ATT_READ_BLOB_RSP => Opcode::ReadBlobResponse,
            ATT_READ_BY_GROUP_TYPE_REQ => Opcode::ReadByGroupTypeRequest,
            ATT_READ_BY_GROUP_TYPE_RSP => Opcode::ReadByGroupTypeResponse,
            ATT_WRITE_REQ => Opcode::WriteRequest,
            ATT_WRITE_RSP => Opcode::WriteResponse,
            ATT_HANDLE_VALUE_NTF => Opcode::HandleValueNotification,
            ATT_HANDLE_VALUE_IND => Opcode::HandleValueIndication,
            ATT_HANDLE_VALUE_CONF => Opcode::HandleValueConfirmation,
            ATT_WRITE_CMD => Opcode::WriteCommand,
            other => return Err(other),
        };
        Ok(opcode)
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        match opcode {
            Opcode::ErrorResponse => ATT_ERROR_RSP,
            Opcode::ExchangeMtuRequest => ATT_EXCHANGE_MTU_REQ,
            Opcode::ExchangeMtuResponse => ATT_EXCHANGE_MTU_RSP,
            Opcode::FindInformationRequest => ATT_FIND_INFO_REQ,
            Opcode::FindInformationResponse => ATT_FIND_INFO_RSP,
            Opcode::ReadByTypeRequest => ATT_READ_BY_TYPE_REQ,
            Opcode::ReadByTypeResponse => ATT_READ_BY_TYPE_RSP,
            Opcode::ReadRequest => ATT_READ_REQ,
            Opcode::ReadResponse => ATT_READ_RSP,
            Opcode::ReadBlobRequest => ATT_READ_BLOB_REQ,
            Opcode::ReadBlobResponse => ATT_READ_BLOB_RSP,
            Opcode::ReadByGroupTypeRequest => ATT_READ_BY_GROUP_TYPE_REQ,
            Opcode::ReadByGroupTypeResponse => ATT_READ_BY_GROUP_TYPE_RSP,
            Opcode::WriteRequest => ATT_WRITE_REQ,
            Opcode::WriteResponse => ATT_WRITE_RSP,
            Opcode::HandleValueNotification => ATT_HANDLE_VALUE_NTF,
            Opcode::HandleValueIndication => ATT_HANDLE_VALUE_IND,
            Opcode::HandleValueConfirmation => ATT_HANDLE_VALUE_CONF,
            Opcode::WriteCommand => ATT_WRITE_CMD,
        }
    }
}

/// Outgoing ATT packet
pub trait AttPacket {
    /// Opcode for this packet
    fn opcode() -> Opcode;

    /// Serialize packet to bytes
    fn serialize(&self) -> Vec<u8>;
}

fn handle_range_packet(opcode: Opcode, start_handle: u16, end_handle: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(21);
    packet.push(opcode.into());
    packet.extend_from_slice(&start_handle.to_le_bytes());
    packet.extend_from_slice(&end_handle.to_le_bytes());
    packet
}

/// Read By Group Type Request packet
#[derive(Debug, Clone)]
pub struct ReadByGroupTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub group_type: Uuid,
}

impl AttPacket for ReadByGroupTypeRequest {
    fn opcode() -> Opcode {
        Opcode::ReadByGroupTypeRequest
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = handle_range_packet(Self::opcode(), self.start_handle, self.end_handle);
        packet.extend_from_slice(&self.group_type.to_wire_bytes());
        packet
    }
}

/// Read By Type Request packet
#[derive(Debug, Clone)]
pub struct ReadByTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: Uuid,
}

impl AttPacket for ReadByTypeRequest {
    fn opcode() -> Opcode {
        Opcode::ReadByTypeRequest
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = handle_range_packet(Self::opcode(), self.start_handle, self.end_handle);
        packet.extend_from_slice(&self.attribute_type.to_wire_bytes());
        packet
    }
}

/// Find Information Request packet
#[derive(Debug, Clone)]
pub struct FindInformationRequest {
    pub start_handle: u16,
    pub end_handle: u16,
}

impl AttPacket for FindInformationRequest {
    fn opcode() -> Opcode {
        Opcode::FindInformationRequest
    }

    fn serialize(&self) -> Vec<u8> {
        handle_range_packet(Self::opcode(), self.start_handle, self.end_handle)
    }
}

/// Read Request packet
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub handle: u16,
}

impl AttPacket for ReadRequest {
    fn opcode() -> Opcode {
        Opcode::ReadRequest
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3);
        packet.push(Self::opcode().into());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet
    }
}

/// Read Blob Request packet
#[derive(Debug, Clone)]
pub struct ReadBlobRequest {
    pub handle: u16,
    pub offset: u16,
}

impl AttPacket for ReadBlobRequest {
    fn opcode() -> Opcode {
        Opcode::ReadBlobRequest
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode().into());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet
    }
}

/// Write Request packet
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteRequest {
    fn opcode() -> Opcode {
        Opcode::WriteRequest
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode().into());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Write Command packet (no response)
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteCommand {
    fn opcode() -> Opcode {
        Opcode::WriteCommand
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode().into());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Handle Value Confirmation packet
#[derive(Debug, Clone, Copy)]
pub struct HandleValueConfirmation;

impl AttPacket for HandleValueConfirmation {
    fn opcode() -> Opcode {
        Opcode::HandleValueConfirmation
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode().into()]
    }
}

pub fn encode_read_by_group_type(start_handle: u16, end_handle: u16, group_type: Uuid) -> Vec<u8> {
    ReadByGroupTypeRequest {
        start_handle,
        end_handle,
        group_type,
    }
    .serialize()
}

pub fn encode_read_by_type(start_handle: u16, end_handle: u16, attribute_type: Uuid) -> Vec<u8> {
    ReadByTypeRequest {
        start_handle,
        end_handle,
        attribute_type,
    }
    .serialize()
}

pub fn encode_find_information(start_handle: u16, end_handle: u16) -> Vec<u8> {
    FindInformationRequest {
        start_handle,
        end_handle,
    }
    .serialize()
}

pub fn encode_read(handle: u16) -> Vec<u8> {
    ReadRequest { handle }.serialize()
}

pub fn encode_write(handle: u16, value: &[u8], without_response: bool) -> Vec<u8> {
    if without_response {
        WriteCommand {
            handle,
            value: value.to_vec(),
        }
        .serialize()
    } else {
        WriteRequest {
            handle,
            value: value.to_vec(),
        }
        .serialize()
    }
}

fn read_handle(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| Error::InvalidPdu(what))
}

/// Error Response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Request opcode in error
    pub request_opcode: u8,
    /// Attribute handle in error
    pub handle: u16,
    /// Error code
    pub error_code: AttErrorCode,
}

impl ErrorResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 || data[0] != ATT_ERROR_RSP {
            return Err(Error::InvalidPdu("error response"));
        }

        let mut cursor = Cursor::new(&data[2..]);
        let handle = read_handle(&mut cursor, "error response handle")?;

        Ok(Self {
            request_opcode: data[1],
            handle,
            error_code: data[4].into(),
        })
    }

    pub fn into_error(self) -> Error {
        Error::Att {
            request: self.request_opcode,
            handle: self.handle,
            code: self.error_code,
        }
    }
}

/// True when `response` is a well-formed Error Response to `request_opcode`
/// on `handle`. Discovery loops use this to spot their terminating
/// "attribute not found".
pub fn is_error_for(request_opcode: u8, handle: u16, response: &[u8]) -> bool {
    match ErrorResponse::parse(response) {
        Ok(rsp) => rsp.request_opcode == request_opcode && rsp.handle == handle,
        Err(_) => false,
    }
}

/// Handle Value Notification or Indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl HandleValue {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 || (data[0] != ATT_HANDLE_VALUE_NTF && data[0] != ATT_HANDLE_VALUE_IND)
        {
            return Err(Error::InvalidPdu("handle value notification"));
        }

        let mut cursor = Cursor::new(&data[1..]);
        let handle = read_handle(&mut cursor, "notification handle")?;

        Ok(Self {
            handle,
            value: data[3..].to_vec(),
        })
    }
}

/// Body of a Read By Type or Read By Group Type response: a record length
/// followed by records of exactly that length.
#[derive(Debug, Clone)]
pub struct AttributeDataList {
    pub length: usize,
    pub data: Vec<u8>,
}

impl AttributeDataList {
    pub fn parse(expected: Opcode, data: &[u8]) -> Result<Self> {
        if data.len() < 2 || data[0] != u8::from(expected) {
            return Err(Error::InvalidPdu("attribute data list"));
        }

        Ok(Self {
            length: data[1] as usize,
            data: data[2..].to_vec(),
        })
    }

    /// Check the record length against the allowed set and split the body.
    pub fn records(&self, opcode: Opcode, allowed: &[usize]) -> Result<std::slice::ChunksExact<'_, u8>> {
        if !allowed.contains(&self.length) || self.data.len() % self.length != 0 {
            return Err(Error::InvalidRecordLength {
                opcode: opcode.into(),
                length: self.length,
            });
        }
        Ok(self.data.chunks_exact(self.length))
    }
}

/// Find Information Response packet
#[derive(Debug, Clone)]
pub struct FindInformationResponse {
    pub format: u8,
    pub data: Vec<u8>,
}

impl FindInformationResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || data[0] != ATT_FIND_INFO_RSP {
            return Err(Error::InvalidPdu("find information response"));
        }

        Ok(Self {
            format: data[1],
            data: data[2..].to_vec(),
        })
    }

    /// Record size implied by the format byte: 4 for 16-bit UUIDs, 18 for
    /// 128-bit UUIDs.
    pub fn record_length(&self) -> Result<usize> {
        let length = match self.format {
            ATT_FIND_INFO_RSP_FORMAT_16BIT => 4,
            ATT_FIND_INFO_RSP_FORMAT_128BIT => 18,
            other => {
                return Err(Error::InvalidRecordLength {
                    opcode: ATT_FIND_INFO_RSP,
                    length: other as usize,
                })
            }
        };
        if self.data.len() % length != 0 {
            return Err(Error::InvalidRecordLength {
                opcode: ATT_FIND_INFO_RSP,
                length: self.data.len(),
            });
        }
        Ok(length)
    }

    /// (handle, uuid) pairs
    pub fn pairs(&self) -> Result<Vec<(u16, Uuid)>> {
        let length = self.record_length()?;
        self.data
            .chunks_exact(length)
            .map(|record| {
                let handle = u16::from_le_bytes([record[0], record[1]]);
                let uuid = Uuid::try_from_slice_le(&record[2..])
                    .ok_or(Error::InvalidPdu("find information uuid"))?;
                Ok((handle, uuid))
            })
            .collect()
    }
}
