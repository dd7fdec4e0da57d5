use crate::gap::constants::*;
use crate::uuid::Uuid;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => f.write_str("public"),
            AddressType::Random => f.write_str("random"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown address type {0:?}")]
pub struct ParseAddressTypeError(pub String);

/// Parses the address type as scan and connection helpers report it.
impl FromStr for AddressType {
    type Err = ParseAddressTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            _ => Err(ParseAddressTypeError(s.to_string())),
        }
    }
}

/// One service-data record: a 16-bit service UUID and its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

/// Everything a peripheral announced in its advertising and scan response
/// data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub tx_power_level: Option<i8>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub service_data: Vec<ServiceData>,
    /// Advertised service UUIDs without duplicates, in first-seen order
    pub services: Vec<Uuid>,
}

impl Advertisement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_le_only(&self) -> bool {
        self.flags
            .map(|flags| flags & ADV_FLAG_BR_EDR_NOT_SUPPORTED != 0)
            .unwrap_or(false)
    }

    pub fn is_discoverable(&self) -> bool {
        self.flags
            .map(|flags| {
                flags & (ADV_FLAG_LE_LIMITED_DISCOVERABLE | ADV_FLAG_LE_GENERAL_DISCOVERABLE) != 0
            })
            .unwrap_or(false)
    }

    /// Service data for `uuid`, if advertised
    pub fn service_data_for(&self, uuid: Uuid) -> Option<&[u8]> {
        self.service_data
            .iter()
            .find(|entry| entry.uuid == uuid)
            .map(|entry| entry.data.as_slice())
    }

    pub(crate) fn add_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
    }

    /// A repeated UUID replaces the earlier payload.
    pub(crate) fn add_service_data(&mut self, uuid: Uuid, data: Vec<u8>) {
        match self.service_data.iter_mut().find(|entry| entry.uuid == uuid) {
            Some(entry) => entry.data = data,
            None => self.service_data.push(ServiceData { uuid, data }),
        }
    }
}
