// Peripheral registry
//
// Collects advertisements into a deduplicated list of peripherals for the
// presentation layer to pick from. Filtering happens on the application
// side: OS scan filters only match UUIDs in the primary advertisement
// packet, while many devices put 128-bit service UUIDs in the scan response.

use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// First manufacturer-specific data entry of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// One advertisement as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    /// Transport-assigned identifier (MAC address or OS UUID).
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub services: Vec<Uuid>,
}

/// A discovered peripheral. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralIdentity {
    pub id: String,
    pub name: String,
    /// Signal strength when first recorded
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub services: Vec<Uuid>,
}

impl PeripheralIdentity {
    /// Identity known only by id and name (e.g. passed on a command line).
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi: None,
            manufacturer_data: None,
            services: Vec::new(),
        }
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeripheralRegistry {
    peripherals: Vec<PeripheralIdentity>,
    seen_ids: HashSet<String>,
    service_filter: Option<Uuid>,
}

impl PeripheralRegistry {
    pub fn new(service_filter: Option<Uuid>) -> Self {
        Self {
            service_filter,
            ..Self::default()
        }
    }

    /// Record an advertisement. Returns the new entry the first time a
    /// named, matching peripheral is seen; repeats and non-matching
    /// advertisements return `None`.
    ///
    /// Unnamed or non-matching advertisements are not remembered, so a
    /// later scan response carrying the name or service still registers.
    pub fn record(&mut self, advertisement: Advertisement) -> Option<&PeripheralIdentity> {
        if self.seen_ids.contains(&advertisement.id) {
            return None;
        }
        let identity = PeripheralIdentity {
            name: advertisement.name?,
            id: advertisement.id,
            rssi: advertisement.rssi,
            manufacturer_data: advertisement.manufacturer_data,
            services: advertisement.services,
        };
        if let Some(filter) = &self.service_filter {
            if !identity.advertises(filter) {
                return None;
            }
        }

        self.seen_ids.insert(identity.id.clone());
        self.peripherals.push(identity);
        self.peripherals.last()
    }

    /// Forget everything (rescan).
    pub fn clear(&mut self) {
        self.peripherals.clear();
        self.seen_ids.clear();
    }

    /// Peripherals in discovery order.
    pub fn peripherals(&self) -> &[PeripheralIdentity] {
        &self.peripherals
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }
}
