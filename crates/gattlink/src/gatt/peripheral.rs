//! A connected remote GATT server
use crate::att::{
    MultiplexerConfig, RequestMultiplexer, SubscriptionRegistry, ATT_DEFAULT_MTU,
    GATT_CCC_INDICATE, GATT_CCC_NOTIFY,
};
use crate::error::{DiscoveryError, Error, Result};
use crate::gap::{AddressType, Advertisement};
use crate::gatt::discovery;
use crate::gatt::types::{Characteristic, Descriptor, IncludedService, Service};
use crate::uuid::Uuid;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Peripheral configuration
#[derive(Debug, Clone)]
pub struct PeripheralConfig {
    /// Request multiplexer settings
    pub multiplexer: MultiplexerConfig,
    /// ATT MTU used to size long reads
    pub mtu: u16,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            mtu: ATT_DEFAULT_MTU,
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A peripheral reached over one ATT bearer.
///
/// The peripheral keeps the discovered attribute graph. Discovery methods
/// take entities by reference and write their results back into the graph,
/// so later lookups (such as the CCCD for a subscription) see them.
pub struct Peripheral {
    address: String,
    address_type: AddressType,
    advertisement: RwLock<Advertisement>,
    services: RwLock<Vec<Service>>,
    registry: Arc<SubscriptionRegistry>,
    mux: RequestMultiplexer,
    config: PeripheralConfig,
}

impl Peripheral {
    /// Attach to a peripheral over the given transport halves
    pub fn new<R, W>(address: &str, address_type: AddressType, reader: R, writer: W) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::with_config(address, address_type, reader, writer, PeripheralConfig::default())
    }

    pub fn with_config<R, W>(
        address: &str,
        address_type: AddressType,
        reader: R,
        writer: W,
        config: PeripheralConfig,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mux = RequestMultiplexer::with_config(
            reader,
            writer,
            Arc::clone(&registry),
            config.multiplexer.clone(),
        )?;
        info!("Attached to peripheral {} ({})", address, address_type);

        Ok(Self {
            address: address.to_string(),
            address_type,
            advertisement: RwLock::new(Advertisement::default()),
            services: RwLock::new(Vec::new()),
            registry,
            mux,
            config,
        })
    }

    /// Upper-cased address
    pub fn id(&self) -> String {
        self.address.to_uppercase()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Advertised local name, if any
    pub fn name(&self) -> Option<String> {
        read_lock(&self.advertisement).local_name.clone()
    }

    pub fn advertisement(&self) -> Advertisement {
        read_lock(&self.advertisement).clone()
    }

    /// Merge freshly received advertising data into this peripheral's record
    pub fn update_advertisement(&self, eir: &[u8]) -> Result<()> {
        write_lock(&self.advertisement).extend_from_eir(eir)
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// Snapshot of the discovered services
    pub fn services(&self) -> Vec<Service> {
        read_lock(&self.services).clone()
    }

    pub fn find_service(&self, uuid: Uuid) -> Option<Service> {
        read_lock(&self.services)
            .iter()
            .find(|s| s.uuid == uuid)
            .cloned()
    }

    pub fn find_characteristic(&self, service: &Service, uuid: Uuid) -> Option<Characteristic> {
        read_lock(&self.services)
            .iter()
            .find(|s| s.start_handle == service.start_handle)
            .and_then(|s| s.find_characteristic(uuid).cloned())
    }

    pub fn is_connected(&self) -> bool {
        !self.mux.is_closed()
    }

    /// Discover primary services, replacing the stored services.
    pub fn discover_services(
        &self,
        filter: &[Uuid],
    ) -> std::result::Result<Vec<Service>, DiscoveryError<Service>> {
        let result = discovery::discover_services(&self.mux, filter);
        let found = match &result {
            Ok(services) => services,
            Err(e) => &e.found,
        };
        *write_lock(&self.services) = found.clone();
        result
    }

    /// Discover the services included by `service`.
    pub fn discover_included_services(
        &self,
        service: &Service,
        filter: &[Uuid],
    ) -> std::result::Result<Vec<IncludedService>, DiscoveryError<IncludedService>> {
        let mut working = service.clone();
        let result = discovery::discover_included_services(&self.mux, &mut working, filter);
        self.store_service(working, |stored, working| {
            stored.included_services = working.included_services;
        });
        result
    }

    /// Discover the characteristics of `service`.
    pub fn discover_characteristics(
        &self,
        service: &Service,
        filter: &[Uuid],
    ) -> std::result::Result<Vec<Characteristic>, DiscoveryError<Characteristic>> {
        let mut working = service.clone();
        let result = discovery::discover_characteristics(&self.mux, &mut working, filter);
        self.store_service(working, |stored, working| {
            stored.characteristics = working.characteristics;
        });
        result
    }

    /// Discover the descriptors of `characteristic`, caching its CCCD.
    pub fn discover_descriptors(
        &self,
        characteristic: &Characteristic,
        filter: &[Uuid],
    ) -> std::result::Result<Vec<Descriptor>, DiscoveryError<Descriptor>> {
        let mut working = characteristic.clone();
        let result = discovery::discover_descriptors(&self.mux, &mut working, filter);

        let mut services = write_lock(&self.services);
        let stored = services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.value_handle == working.value_handle);
        if let Some(stored) = stored {
            stored.descriptors = working.descriptors;
            stored.cccd = working.cccd;
        }
        result
    }

    fn store_service<F>(&self, working: Service, update: F)
    where
        F: FnOnce(&mut Service, Service),
    {
        let mut services = write_lock(&self.services);
        match services
            .iter_mut()
            .find(|s| s.start_handle == working.start_handle)
        {
            Some(stored) => update(stored, working),
            None => debug!("{} is not in the stored service list", working),
        }
    }

    pub fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        discovery::read(&self.mux, characteristic.value_handle)
    }

    /// Read a characteristic value longer than one response can carry
    pub fn read_long_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        discovery::read_long(&self.mux, characteristic.value_handle, self.config.mtu)
    }

    pub fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        without_response: bool,
    ) -> Result<()> {
        discovery::write(&self.mux, characteristic.value_handle, value, without_response)
    }

    pub fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        discovery::read(&self.mux, descriptor.handle)
    }

    pub fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        discovery::write(&self.mux, descriptor.handle, value, false)
    }

    /// CCCD of `characteristic`, preferring what discovery stored in the graph
    fn cccd_for(&self, characteristic: &Characteristic) -> Result<Descriptor> {
        let stored = read_lock(&self.services)
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.value_handle == characteristic.value_handle)
            .and_then(|c| c.cccd.clone());

        stored
            .or_else(|| characteristic.cccd.clone())
            .ok_or(Error::NoCccd(characteristic.value_handle))
    }

    /// Enable notifications; `callback` receives the value handle and value.
    pub fn enable_notifications<F>(&self, characteristic: &Characteristic, callback: F) -> Result<()>
    where
        F: FnMut(u16, &[u8]) + Send + 'static,
    {
        self.enable(characteristic, GATT_CCC_NOTIFY, callback)
    }

    /// Enable indications. Confirmations are sent automatically.
    pub fn enable_indications<F>(&self, characteristic: &Characteristic, callback: F) -> Result<()>
    where
        F: FnMut(u16, &[u8]) + Send + 'static,
    {
        self.enable(characteristic, GATT_CCC_INDICATE, callback)
    }

    fn enable<F>(&self, characteristic: &Characteristic, flag: u16, callback: F) -> Result<()>
    where
        F: FnMut(u16, &[u8]) + Send + 'static,
    {
        let cccd = self.cccd_for(characteristic)?;
        let handle = characteristic.value_handle;

        // Values may arrive before the write response does. A failed write
        // puts back whatever subscription the handle had before.
        let swapped = self.registry.swap(handle, callback)?;
        if let Err(e) = discovery::write(&self.mux, cccd.handle, &flag.to_le_bytes(), false) {
            warn!("Enabling updates on 0x{:04X} failed: {}", handle, e);
            self.registry.restore(swapped);
            return Err(e);
        }
        self.registry.commit(swapped);
        debug!("Enabled updates (0x{:04X}) on 0x{:04X}", flag, handle);
        Ok(())
    }

    /// Disable notifications and indications and drop the callback.
    ///
    /// The callback is removed even when the peer rejects the write.
    pub fn disable_notifications_and_indications(
        &self,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let cccd = self.cccd_for(characteristic)?;
        let result = discovery::write(&self.mux, cccd.handle, &[0x00, 0x00], false);
        self.registry.unsubscribe(characteristic.value_handle);
        result
    }

    /// Close the bearer: pending and later requests fail with
    /// [`Error::TransportClosed`] and every subscription is dropped.
    pub fn disconnect(&self) {
        info!("Disconnecting from {}", self.address);
        self.mux.close();
        self.registry.clear();
    }
}

impl Drop for Peripheral {
    fn drop(&mut self) {
        self.registry.clear();
    }
}
