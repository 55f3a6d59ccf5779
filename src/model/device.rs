// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity views returned by the entity query service.

use serde::{Deserialize, Serialize};

/// The parts of a device the subscription engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// The device's string id.
    pub device_id: String,
    /// Network the device belongs to.
    pub network_id: Option<i64>,
    /// Device type of the device.
    pub device_type_id: Option<i64>,
}

impl DeviceInfo {
    /// Creates a device view with no network or device type.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            network_id: None,
            device_type_id: None,
        }
    }

    /// Sets the network.
    #[must_use]
    pub fn with_network(mut self, network_id: i64) -> Self {
        self.network_id = Some(network_id);
        self
    }

    /// Sets the device type.
    #[must_use]
    pub fn with_device_type(mut self, device_type_id: i64) -> Self {
        self.device_type_id = Some(device_type_id);
        self
    }
}

/// A network entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Network id.
    pub id: i64,
    /// Display name.
    pub name: String,
}

/// A device type entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    /// Device type id.
    pub id: i64,
    /// Display name.
    pub name: String,
}
