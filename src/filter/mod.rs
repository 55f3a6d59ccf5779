// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical subscription criteria.
//!
//! A [`Filter`] names one event stream and optionally narrows it by network,
//! device type, device and sub-topic name. Unset fields are wildcards, so the
//! filter with every scoping field unset (the *global* filter) matches every
//! event of its kind.
//!
//! The [`FilterBuilder`] turns a subscribe request into the set of filters
//! the caller is authorized to receive.
//!
//! # Examples
//!
//! ```
//! use hivebus::filter::Filter;
//! use hivebus::model::{DeviceInfo, EventKind};
//!
//! let device = DeviceInfo::new("D1").with_network(5).with_device_type(7);
//! let filter = Filter::for_device(EventKind::Notification, &device).with_name("temp");
//!
//! assert_eq!(filter.device_id.as_deref(), Some("D1"));
//! assert!(!filter.is_global());
//! ```

mod builder;

use serde::{Deserialize, Serialize};

use crate::model::{DeviceInfo, EventKind, EventScope};

pub use builder::{FilterBuilder, SubscribeParams};

/// A canonical subscription criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Event stream.
    pub kind: EventKind,
    /// Network, or any.
    pub network_id: Option<i64>,
    /// Device type, or any.
    pub device_type_id: Option<i64>,
    /// Device, or any.
    pub device_id: Option<String>,
    /// Sub-topic (command or notification name), or any.
    pub name: Option<String>,
}

impl Filter {
    /// The filter matching every event of `kind`.
    #[must_use]
    pub fn global(kind: EventKind) -> Self {
        Self {
            kind,
            network_id: None,
            device_type_id: None,
            device_id: None,
            name: None,
        }
    }

    /// A filter scoped by network and device type; `None` leaves a dimension open.
    #[must_use]
    pub fn scoped(kind: EventKind, network_id: Option<i64>, device_type_id: Option<i64>) -> Self {
        Self {
            network_id,
            device_type_id,
            ..Self::global(kind)
        }
    }

    /// A filter scoped to a single device, within its own network and device type.
    #[must_use]
    pub fn for_device(kind: EventKind, device: &DeviceInfo) -> Self {
        Self {
            kind,
            network_id: device.network_id,
            device_type_id: device.device_type_id,
            device_id: Some(device.device_id.clone()),
            name: None,
        }
    }

    /// Narrows the filter to one sub-topic.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns `true` if every scoping field is unset.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.network_id.is_none()
            && self.device_type_id.is_none()
            && self.device_id.is_none()
            && self.name.is_none()
    }

    /// Returns `true` if an event with `scope` should be delivered.
    ///
    /// Every field set on the filter must equal the event's value; unset
    /// fields match anything.
    #[must_use]
    pub fn matches(&self, scope: &EventScope) -> bool {
        self.kind == scope.kind
            && self.network_id.is_none_or(|n| scope.network_id == Some(n))
            && self
                .device_type_id
                .is_none_or(|t| scope.device_type_id == Some(t))
            && self.device_id.as_deref().is_none_or(|d| d == scope.device_id)
            && self.name.as_deref().is_none_or(|n| n == scope.name)
    }
}
