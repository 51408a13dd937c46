// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device adapters and the sensor roster
//!
//! A [`DeviceAdapter`] knows how to enumerate, probe and read the devices of
//! one class. The scheduler turns the candidates that answered a probe into a
//! [`Roster`], fixed for the rest of the process.

use std::fmt;
use std::future::Future;

use growbox::{DeviceClass, Sample, SensorId};

use crate::error::{DeviceError, GatewayError, Result};

/// Reads samples from the devices of one class
pub trait DeviceAdapter: Send + Sync + 'static {
    /// Address of one device, as handed back to `probe` and `read`
    type Device: Clone + fmt::Debug + Send + Sync + 'static;

    fn class(&self) -> DeviceClass;

    /// Every device that might be present
    fn candidates(&self) -> Vec<Self::Device>;

    /// Stable identity of a device
    fn sensor_id(&self, device: &Self::Device) -> SensorId;

    /// Resolve once the transport can start a new transaction.
    ///
    /// Time spent here is not charged to the next device's timeout.
    fn ready(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Check that the device answers and is supported
    fn probe(
        &self,
        device: &Self::Device,
    ) -> impl Future<Output = std::result::Result<(), DeviceError>> + Send;

    /// Take one measurement. Never retries.
    fn read(&self, device: &Self::Device)
        -> impl Future<Output = std::result::Result<Sample, DeviceError>> + Send;
}

/// A device accepted during scanning
#[derive(Debug, Clone)]
pub struct RosterEntry<D> {
    pub sensor_id: SensorId,
    pub device: D,
}

/// Ordered set of discovered devices with unique identities
#[derive(Debug, Clone)]
pub struct Roster<D> {
    entries: Vec<RosterEntry<D>>,
}

impl<D> Roster<D> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a device, rejecting an identity already present
    pub fn insert(&mut self, sensor_id: SensorId, device: D) -> Result<()> {
        if self.contains(&sensor_id) {
            return Err(GatewayError::DuplicateSensor(sensor_id));
        }
        self.entries.push(RosterEntry { sensor_id, device });
        Ok(())
    }

    pub fn contains(&self, sensor_id: &SensorId) -> bool {
        self.entries.iter().any(|e| &e.sensor_id == sensor_id)
    }

    /// Entries in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry<D>> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<SensorId> {
        self.entries.iter().map(|e| e.sensor_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<D> Default for Roster<D> {
    fn default() -> Self {
        Self::new()
    }
}
