//! gattlink - a Bluetooth Low Energy GATT client engine
//!
//! The crate talks ATT over any byte-stream transport (anything `Read` and
//! `Write`), decodes advertising data, discovers the service, characteristic
//! and descriptor graph of a peripheral, and delivers notifications and
//! indications to per-handle callbacks.

pub mod att;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod uuid;

// Re-export common types for convenience
pub use att::{MismatchPolicy, MultiplexerConfig, RequestMultiplexer, SubscriptionRegistry};
pub use error::{DiscoveryError, Error, Result};
pub use gap::{AddressType, Advertisement};
pub use gatt::{
    Characteristic, CharacteristicProperty, Descriptor, Peripheral, PeripheralConfig, Service,
};
pub use uuid::Uuid;
