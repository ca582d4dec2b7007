//! Attach-ordered device registry.
//!
//! Holds every attached device in attach order and answers wildcard
//! queries. Adds and removes happen under the single list lock; lookups
//! hold it only across the walk.

use std::sync::Arc;

use log::debug;

use crate::device::{DeviceCtx, DeviceKey, IGNORE_FIELD_16, IGNORE_FIELD_8};
use crate::status::{ApiStatus, CanFail};

pub struct DeviceRegistry {
    devices: spin::Mutex<Vec<Arc<DeviceCtx>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: spin::Mutex::new(Vec::new()),
        }
    }

    /// Appends a device, returning its attach index.
    pub fn add(&self, device: Arc<DeviceCtx>) -> usize {
        let mut devices = self.devices.lock();
        devices.push(device);
        devices.len() - 1
    }

    /// Removes a device by identity.
    pub fn remove(&self, device: &Arc<DeviceCtx>) -> CanFail<ApiStatus> {
        let mut devices = self.devices.lock();

        let position = devices
            .iter()
            .position(|entry| Arc::ptr_eq(entry, device))
            .ok_or(ApiStatus::Failed)?;

        devices.remove(position);

        Ok(())
    }

    /// Device at attach index `index`, the minor-number lookup.
    pub fn get(&self, index: usize) -> Option<Arc<DeviceCtx>> {
        self.devices.lock().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the attached devices, in attach order.
    pub fn snapshot(&self) -> Vec<Arc<DeviceCtx>> {
        self.devices.lock().clone()
    }

    /// Finds the `nth` (zero-based) device matching `query`.
    ///
    /// Query fields holding the `IGNORE` sentinel match any value. On a hit
    /// the full key of the device is written back into `query`. With no hit
    /// the total number of matches is written into `nth` and `InvalidData`
    /// is returned.
    pub fn find(&self, query: &mut DeviceKey, nth: &mut u16) -> CanFail<ApiStatus> {
        let devices = self.devices.lock();

        let mut match_count: u16 = 0;

        for device in devices.iter() {
            let key = device.key();

            if !key_matches(query, &key) {
                continue;
            }

            if match_count == *nth {
                *query = key;

                debug!(
                    target: "plxcore::device",
                    "criteria matched device {:04X}_{:04X} [b:{:02x} s:{:02x} f:{:x}]",
                    key.device, key.vendor, key.bus, key.slot, key.function
                );

                return Ok(());
            }

            match_count += 1;
        }

        *nth = match_count;

        debug!(target: "plxcore::device", "criteria did not match any devices");

        Err(ApiStatus::InvalidData)
    }
}

fn key_matches(query: &DeviceKey, key: &DeviceKey) -> bool {
    let location_ok = (query.bus == IGNORE_FIELD_8 || query.bus == key.bus)
        && (query.slot == IGNORE_FIELD_8 || query.slot == key.slot)
        && (query.function == IGNORE_FIELD_8 || query.function == key.function);

    let id_ok = (query.vendor == IGNORE_FIELD_16 || query.vendor == key.vendor)
        && (query.device == IGNORE_FIELD_16 || query.device == key.device)
        && (query.sub_vendor == IGNORE_FIELD_16 || query.sub_vendor == key.sub_vendor)
        && (query.sub_device == IGNORE_FIELD_16 || query.sub_device == key.sub_device)
        && (query.revision == IGNORE_FIELD_8 || query.revision == key.revision);

    location_ok && id_ok
}
