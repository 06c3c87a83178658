//! Devices addressed by a numeric id.
//!
//! Entry points that only receive a device id, like the C API, resolve it
//! through a `DeviceRegistry` owned by whoever creates the devices.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::debug;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device {0} is already registered")]
    AlreadyRegistered(u32),
    #[error("no device registered with id {0}")]
    NotFound(u32),
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register `device` under `id` and return a shared handle to it.
    pub fn register(&self, id: u32, device: Device) -> Result<Arc<Device>, RegistryError> {
        let mut devices = self.devices.write().unwrap();
        if devices.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        let device = Arc::new(device);
        devices.insert(id, Arc::clone(&device));
        debug!("Registered device {}", id);

        Ok(device)
    }

    pub fn get(&self, id: u32) -> Result<Arc<Device>, RegistryError> {
        self.devices
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove device `id` from the registry. The device itself is dropped
    /// once the last handle to it is.
    pub fn unregister(&self, id: u32) -> Result<Arc<Device>, RegistryError> {
        let device = self
            .devices
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        debug!("Unregistered device {}", id);

        Ok(device)
    }

    /// Registered ids, in increasing order.
    pub fn ids(&self) -> Vec<u32> {
        self.devices.read().unwrap().keys().copied().collect()
    }
}
