//! Common types for GATT operations
//!
//! A peripheral owns its services, a service owns its characteristics and a
//! characteristic owns its descriptors. Descriptors point back at their
//! characteristic by value handle only.

use crate::att::CLIENT_CHAR_CONFIG_UUID;
use crate::uuid::Uuid;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Characteristic properties as defined in the Bluetooth specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperty: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperty {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_write_without_response(&self) -> bool {
        self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }
}

/// A GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service UUID
    pub uuid: Uuid,
    /// Whether this is a primary or secondary service
    pub is_primary: bool,
    /// Start handle for this service
    pub start_handle: u16,
    /// End handle for this service, inclusive
    pub end_handle: u16,
    pub characteristics: Vec<Characteristic>,
    pub included_services: Vec<IncludedService>,
}

impl Service {
    pub fn new(uuid: Uuid, start_handle: u16, end_handle: u16) -> Self {
        Self {
            uuid,
            is_primary: true,
            start_handle,
            end_handle,
            characteristics: Vec::new(),
            included_services: Vec::new(),
        }
    }

    /// True when a characteristic declared at `declaration` with its value at
    /// `value` lies inside this service.
    pub fn contains(&self, declaration: u16, value: u16) -> bool {
        self.start_handle < declaration && self.end_handle >= value
    }

    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Service {} [0x{:04X}-0x{:04X}]",
            self.uuid, self.start_handle, self.end_handle
        )
    }
}

/// A service referenced from another service's include declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedService {
    /// Handle of the include declaration
    pub handle: u16,
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

/// A GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Declaration handle
    pub declaration_handle: u16,
    /// Value handle
    pub value_handle: u16,
    /// Characteristic properties
    pub properties: CharacteristicProperty,
    /// Last handle belonging to this characteristic. Provisional (the owning
    /// service's end) until the next declaration is discovered.
    pub end_handle: u16,
    pub descriptors: Vec<Descriptor>,
    /// Client Characteristic Configuration descriptor, once discovered
    pub cccd: Option<Descriptor>,
}

impl Characteristic {
    pub fn new(
        uuid: Uuid,
        declaration_handle: u16,
        value_handle: u16,
        properties: CharacteristicProperty,
        end_handle: u16,
    ) -> Self {
        Self {
            uuid,
            declaration_handle,
            value_handle,
            properties,
            end_handle,
            descriptors: Vec::new(),
            cccd: None,
        }
    }

    pub fn find_descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Characteristic {} [0x{:04X}/0x{:04X}-0x{:04X}] {:?}",
            self.uuid, self.declaration_handle, self.value_handle, self.end_handle, self.properties
        )
    }
}

/// A GATT characteristic descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
    /// Value handle of the owning characteristic
    pub characteristic: u16,
}

impl Descriptor {
    pub fn is_cccd(&self) -> bool {
        self.uuid == CLIENT_CHAR_CONFIG_UUID
    }
}
