//! GATT (Generic Attribute Profile) client
//!
//! Discovery of the attribute graph of a connected peripheral, value access
//! and notification/indication subscriptions.

pub mod discovery;
pub mod peripheral;
pub mod types;


pub use peripheral::{Peripheral, PeripheralConfig};
pub use types::{Characteristic, CharacteristicProperty, Descriptor, IncludedService, Service};
