//! GATT discovery and attribute access over a [`RequestMultiplexer`]
//!
//! Every discovery procedure walks a handle cursor forward through a range,
//! one request per step, until the range is exhausted or the peer answers
//! "attribute not found" for the cursor. Every record must lie past the one
//! before it, the first past the cursor; anything else aborts with
//! [`Error::NonMonotonicHandle`].
//!
//! On failure the discovery functions return a [`DiscoveryError`] carrying
//! whatever was found before the failing step.

use crate::att::{
    encode_find_information, encode_read, encode_read_by_group_type, encode_read_by_type,
    encode_write, is_error_for, AttErrorCode, AttPacket, AttributeDataList, ErrorResponse,
    FindInformationResponse, Opcode, ReadBlobRequest, RequestMultiplexer, ATT_ERROR_RSP,
    ATT_HANDLE_MAX, ATT_HANDLE_MIN, CHARACTERISTIC_UUID, CLIENT_CHAR_CONFIG_UUID, INCLUDE_UUID,
    PRIMARY_SERVICE_UUID,
};
use crate::error::{DiscoveryError, Error, Result};
use crate::gatt::types::{
    Characteristic, CharacteristicProperty, Descriptor, IncludedService, Service,
};
use crate::uuid::Uuid;
use log::{debug, trace};

/// Accepts everything when the filter is empty
fn matches_filter(filter: &[Uuid], uuid: &Uuid) -> bool {
    filter.is_empty() || filter.contains(uuid)
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Fails unless `next` lies past `last`, the highest handle already claimed
/// in this step, or at or after `cursor` for a step's first record.
fn check_advance(cursor: u16, last: Option<u16>, next: u16) -> Result<()> {
    let advanced = match last {
        Some(last) => next > last,
        None => next >= cursor,
    };
    if advanced {
        Ok(())
    } else {
        Err(Error::NonMonotonicHandle {
            previous: last.unwrap_or(cursor),
            next,
        })
    }
}

fn parse_uuid(bytes: &[u8]) -> Result<Uuid> {
    Uuid::try_from_slice_le(bytes).ok_or(Error::InvalidPdu("attribute UUID"))
}

/// One discovery step. `None` when the peer reports that nothing is left at
/// or after `cursor`.
fn request_page(
    mux: &RequestMultiplexer,
    pdu: &[u8],
    request: Opcode,
    cursor: u16,
) -> Result<Option<Vec<u8>>> {
    let response = mux.send_request(pdu)?;
    if response.first() != Some(&ATT_ERROR_RSP) {
        return Ok(Some(response));
    }

    let error = ErrorResponse::parse(&response)?;
    if is_error_for(request.into(), cursor, &response)
        && error.error_code == AttErrorCode::AttributeNotFound
    {
        trace!("{:?} exhausted at 0x{:04X}", request, cursor);
        return Ok(None);
    }
    Err(error.into_error())
}

/// Turn an Error Response into an error, otherwise strip the expected opcode.
fn expect_response(response: Vec<u8>, expected: Opcode) -> Result<Vec<u8>> {
    match response.first() {
        Some(&ATT_ERROR_RSP) => Err(ErrorResponse::parse(&response)?.into_error()),
        Some(&opcode) if opcode == u8::from(expected) => Ok(response[1..].to_vec()),
        Some(&opcode) => Err(Error::ProtocolMismatch {
            request: response_request(expected),
            response: opcode,
        }),
        None => Err(Error::InvalidPdu("empty response")),
    }
}

fn response_request(response: Opcode) -> u8 {
    match response {
        Opcode::ReadResponse => Opcode::ReadRequest.into(),
        Opcode::ReadBlobResponse => Opcode::ReadBlobRequest.into(),
        Opcode::WriteResponse => Opcode::WriteRequest.into(),
        other => other.into(),
    }
}

fn finish<T: std::fmt::Debug>(
    result: Result<()>,
    found: Vec<T>,
) -> std::result::Result<Vec<T>, DiscoveryError<T>> {
    match result {
        Ok(()) => Ok(found),
        Err(e) => {
            debug!("Discovery stopped after {} entries: {}", found.len(), e);
            Err(DiscoveryError::new(found, e))
        }
    }
}

/// Discover primary services across the whole handle space.
pub fn discover_services(
    mux: &RequestMultiplexer,
    filter: &[Uuid],
) -> std::result::Result<Vec<Service>, DiscoveryError<Service>> {
    let mut found = Vec::new();
    let result = services_into(mux, filter, &mut found);
    finish(result, found)
}

fn services_into(mux: &RequestMultiplexer, filter: &[Uuid], found: &mut Vec<Service>) -> Result<()> {
    let group_type = Uuid::from_u16(PRIMARY_SERVICE_UUID);
    let mut cursor = ATT_HANDLE_MIN;

    loop {
        let pdu = encode_read_by_group_type(cursor, ATT_HANDLE_MAX, group_type);
        let response = match request_page(mux, &pdu, Opcode::ReadByGroupTypeRequest, cursor)? {
            Some(response) => response,
            None => break,
        };

        let list = AttributeDataList::parse(Opcode::ReadByGroupTypeResponse, &response)?;
        let mut last_end = None;
        for record in list.records(Opcode::ReadByGroupTypeResponse, &[6, 20])? {
            let start = le_u16(&record[0..2]);
            let end = le_u16(&record[2..4]);
            check_advance(cursor, last_end, start)?;
            if end < start {
                return Err(Error::NonMonotonicHandle {
                    previous: start,
                    next: end,
                });
            }

            let uuid = parse_uuid(&record[4..])?;
            debug!("Found service {} [0x{:04X}-0x{:04X}]", uuid, start, end);
            if matches_filter(filter, &uuid) {
                found.push(Service::new(uuid, start, end));
            }
            last_end = Some(end);
        }

        match last_end {
            None => break,
            Some(ATT_HANDLE_MAX) => break,
            Some(end) => cursor = end + 1,
        }
    }

    Ok(())
}

/// Discover the characteristics of `service`, replacing its characteristic
/// list. Even on failure the list holds what was found.
///
/// End handles are resolved over every declaration in the range, including
/// ones the filter drops.
pub fn discover_characteristics(
    mux: &RequestMultiplexer,
    service: &mut Service,
    filter: &[Uuid],
) -> std::result::Result<Vec<Characteristic>, DiscoveryError<Characteristic>> {
    let mut all = Vec::new();
    let result = characteristics_into(mux, service, &mut all);

    service.characteristics = all
        .into_iter()
        .filter(|c| matches_filter(filter, &c.uuid))
        .collect();
    finish(result, service.characteristics.clone())
}

fn characteristics_into(
    mux: &RequestMultiplexer,
    service: &Service,
    found: &mut Vec<Characteristic>,
) -> Result<()> {
    let attribute_type = Uuid::from_u16(CHARACTERISTIC_UUID);
    let mut cursor = service.start_handle;

    while cursor <= service.end_handle {
        let pdu = encode_read_by_type(cursor, service.end_handle, attribute_type);
        let response = match request_page(mux, &pdu, Opcode::ReadByTypeRequest, cursor)? {
            Some(response) => response,
            None => break,
        };

        let list = AttributeDataList::parse(Opcode::ReadByTypeResponse, &response)?;
        let mut last_value = None;
        for record in list.records(Opcode::ReadByTypeResponse, &[7, 21])? {
            let declaration = le_u16(&record[0..2]);
            let properties = CharacteristicProperty::from_bits_truncate(record[2]);
            let value = le_u16(&record[3..5]);
            let uuid = parse_uuid(&record[5..])?;

            check_advance(cursor, last_value, declaration)?;
            if value <= declaration {
                return Err(Error::NonMonotonicHandle {
                    previous: declaration,
                    next: value,
                });
            }
            if !service.contains(declaration, value) {
                return Err(Error::UnownedCharacteristic { declaration, value });
            }

            if let Some(previous) = found.last_mut() {
                previous.end_handle = declaration - 1;
            }
            debug!(
                "Found characteristic {} [0x{:04X}/0x{:04X}] {:?}",
                uuid, declaration, value, properties
            );
            found.push(Characteristic::new(
                uuid,
                declaration,
                value,
                properties,
                service.end_handle,
            ));
            last_value = Some(value);
        }

        match last_value {
            Some(value) if value < service.end_handle => cursor = value + 1,
            _ => break,
        }
    }

    Ok(())
}

/// Discover the descriptors of `characteristic` over
/// `(value_handle, end_handle]`, replacing its descriptor list.
///
/// The Client Characteristic Configuration descriptor is cached on the
/// characteristic even when the filter leaves it out of the list.
pub fn discover_descriptors(
    mux: &RequestMultiplexer,
    characteristic: &mut Characteristic,
    filter: &[Uuid],
) -> std::result::Result<Vec<Descriptor>, DiscoveryError<Descriptor>> {
    let mut found = Vec::new();
    characteristic.cccd = None;
    let result = descriptors_into(mux, characteristic, filter, &mut found);
    characteristic.descriptors = found.clone();
    finish(result, found)
}

fn descriptors_into(
    mux: &RequestMultiplexer,
    characteristic: &mut Characteristic,
    filter: &[Uuid],
    found: &mut Vec<Descriptor>,
) -> Result<()> {
    let end = characteristic.end_handle;
    let mut cursor = match characteristic.value_handle.checked_add(1) {
        Some(start) if start <= end => start,
        _ => return Ok(()),
    };

    loop {
        let pdu = encode_find_information(cursor, end);
        let response = match request_page(mux, &pdu, Opcode::FindInformationRequest, cursor)? {
            Some(response) => response,
            None => break,
        };

        let info = FindInformationResponse::parse(&response)?;
        let mut last_handle = None;
        for (handle, uuid) in info.pairs()? {
            check_advance(cursor, last_handle, handle)?;

            let descriptor = Descriptor {
                uuid,
                handle,
                characteristic: characteristic.value_handle,
            };
            trace!("Found descriptor {} at 0x{:04X}", uuid, handle);
            if uuid == CLIENT_CHAR_CONFIG_UUID {
                characteristic.cccd = Some(descriptor.clone());
            }
            if matches_filter(filter, &uuid) {
                found.push(descriptor);
            }
            last_handle = Some(handle);
        }

        match last_handle {
            Some(handle) if handle < end => cursor = handle + 1,
            _ => break,
        }
    }

    Ok(())
}

/// Discover the services included by `service`, replacing its include list.
///
/// Include declarations for 128-bit services carry no UUID; it is read from
/// the included service's declaration.
pub fn discover_included_services(
    mux: &RequestMultiplexer,
    service: &mut Service,
    filter: &[Uuid],
) -> std::result::Result<Vec<IncludedService>, DiscoveryError<IncludedService>> {
    let mut found = Vec::new();
    let result = included_into(mux, service, filter, &mut found);
    service.included_services = found.clone();
    finish(result, found)
}

fn included_into(
    mux: &RequestMultiplexer,
    service: &Service,
    filter: &[Uuid],
    found: &mut Vec<IncludedService>,
) -> Result<()> {
    let attribute_type = Uuid::from_u16(INCLUDE_UUID);
    let mut cursor = service.start_handle;

    while cursor <= service.end_handle {
        let pdu = encode_read_by_type(cursor, service.end_handle, attribute_type);
        let response = match request_page(mux, &pdu, Opcode::ReadByTypeRequest, cursor)? {
            Some(response) => response,
            None => break,
        };

        let list = AttributeDataList::parse(Opcode::ReadByTypeResponse, &response)?;
        let mut last_handle = None;
        for record in list.records(Opcode::ReadByTypeResponse, &[6, 8])? {
            let handle = le_u16(&record[0..2]);
            check_advance(cursor, last_handle, handle)?;
            let start_handle = le_u16(&record[2..4]);
            let end_handle = le_u16(&record[4..6]);
            let uuid = if record.len() == 8 {
                parse_uuid(&record[6..8])?
            } else {
                parse_uuid(&read(mux, start_handle)?)?
            };

            debug!(
                "Found included service {} [0x{:04X}-0x{:04X}]",
                uuid, start_handle, end_handle
            );
            if matches_filter(filter, &uuid) {
                found.push(IncludedService {
                    handle,
                    uuid,
                    start_handle,
                    end_handle,
                });
            }
            last_handle = Some(handle);
        }

        match last_handle {
            Some(handle) if handle < service.end_handle => cursor = handle + 1,
            _ => break,
        }
    }

    Ok(())
}

/// Read an attribute value with a single Read request
pub fn read(mux: &RequestMultiplexer, handle: u16) -> Result<Vec<u8>> {
    let response = mux.send_request(&encode_read(handle))?;
    expect_response(response, Opcode::ReadResponse)
}

/// Read a value of any length, continuing with Read Blob requests while
/// responses come back full.
pub fn read_long(mux: &RequestMultiplexer, handle: u16, mtu: u16) -> Result<Vec<u8>> {
    let chunk_size = (mtu as usize).saturating_sub(1).max(1);
    let mut value = read(mux, handle)?;
    let mut last_chunk = value.len();

    while last_chunk == chunk_size {
        let offset = match u16::try_from(value.len()) {
            Ok(offset) => offset,
            Err(_) => break,
        };
        let pdu = ReadBlobRequest { handle, offset }.serialize();
        let response = mux.send_request(&pdu)?;
        let chunk = match expect_response(response, Opcode::ReadBlobResponse) {
            Ok(chunk) => chunk,
            Err(Error::Att {
                code: AttErrorCode::AttributeNotLong | AttErrorCode::InvalidOffset,
                ..
            }) => break,
            Err(e) => return Err(e),
        };
        trace!("Read blob 0x{:04X}+{}: {} bytes", handle, offset, chunk.len());
        last_chunk = chunk.len();
        value.extend_from_slice(&chunk);
    }

    Ok(value)
}

/// Write an attribute value. Without response, the value goes out as a Write
/// Command and no acknowledgement is awaited.
pub fn write(
    mux: &RequestMultiplexer,
    handle: u16,
    value: &[u8],
    without_response: bool,
) -> Result<()> {
    let pdu = encode_write(handle, value, without_response);
    if without_response {
        return mux.send_command(&pdu);
    }
    let response = mux.send_request(&pdu)?;
    expect_response(response, Opcode::WriteResponse)?;
    Ok(())
}
