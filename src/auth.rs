// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticated principals and their permission scope.
//!
//! A [`Principal`] is captured when a connection authenticates and is consulted
//! by the [`FilterBuilder`](crate::filter::FilterBuilder) whenever the
//! connection subscribes. Each scoping dimension (networks, device types) is
//! described by an [`Access`] value.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Role of the authenticated user or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Administrator.
    Admin,
    /// Regular client user.
    Client,
    /// A device authenticated with its own credentials.
    Device,
}

/// A scoping dimension of the permission model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Network ids.
    Networks,
    /// Device type ids.
    DeviceTypes,
}

/// What a principal may access along one [`Dimension`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "access", content = "ids", rename_all = "snake_case")]
pub enum Access {
    /// Everything, present and future.
    All,
    /// Exactly these ids.
    Listed(BTreeSet<i64>),
    /// Granted through user assignments the principal does not enumerate;
    /// the entity query service resolves the set on demand.
    Delegated,
}

impl Access {
    /// Returns `Some(allowed)` when the answer is known locally.
    #[must_use]
    pub fn permits(&self, id: i64) -> Option<bool> {
        match self {
            Self::All => Some(true),
            Self::Listed(ids) => Some(ids.contains(&id)),
            Self::Delegated => None,
        }
    }
}

/// The permission and authorization context of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Authenticated user, if any.
    pub user_id: Option<i64>,
    /// Role of the principal.
    pub role: Role,
    /// Network access.
    pub networks: Access,
    /// Device type access.
    pub device_types: Access,
}

impl Principal {
    /// An administrator with unrestricted access.
    #[must_use]
    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            role: Role::Admin,
            networks: Access::All,
            device_types: Access::All,
        }
    }

    /// A client whose networks are resolved through the backend.
    #[must_use]
    pub fn client(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            role: Role::Client,
            networks: Access::Delegated,
            device_types: Access::All,
        }
    }

    /// Restricts network access to exactly `ids`.
    #[must_use]
    pub fn with_networks(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.networks = Access::Listed(ids.into_iter().collect());
        self
    }

    /// Restricts device type access to exactly `ids`.
    #[must_use]
    pub fn with_device_types(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.device_types = Access::Listed(ids.into_iter().collect());
        self
    }

    /// Returns the access descriptor for `dimension`.
    #[must_use]
    pub fn access(&self, dimension: Dimension) -> &Access {
        match dimension {
            Dimension::Networks => &self.networks,
            Dimension::DeviceTypes => &self.device_types,
        }
    }

    /// Returns `true` if every id along `dimension` is permitted.
    #[must_use]
    pub fn all_allowed(&self, dimension: Dimension) -> bool {
        matches!(self.access(dimension), Access::All)
    }

    /// Returns the enumerated network ids, if the principal lists them.
    #[must_use]
    pub fn allowed_network_ids(&self) -> Option<&BTreeSet<i64>> {
        match &self.networks {
            Access::Listed(ids) => Some(ids),
            Access::All | Access::Delegated => None,
        }
    }

    /// Returns the enumerated device type ids, if the principal lists them.
    #[must_use]
    pub fn allowed_device_type_ids(&self) -> Option<&BTreeSet<i64>> {
        match &self.device_types {
            Access::Listed(ids) => Some(ids),
            Access::All | Access::Delegated => None,
        }
    }

    /// Returns `true` for client users.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_unrestricted() {
        let admin = Principal::admin(1);
        assert!(admin.all_allowed(Dimension::Networks));
        assert!(admin.all_allowed(Dimension::DeviceTypes));
        assert!(admin.allowed_network_ids().is_none());
    }

    #[test]
    fn listed_access_permits_only_members() {
        let client = Principal::client(2).with_networks([5]);
        assert_eq!(client.networks.permits(5), Some(true));
        assert_eq!(client.networks.permits(6), Some(false));
        assert_eq!(client.allowed_network_ids().map(BTreeSet::len), Some(1));
    }

    #[test]
    fn delegated_access_is_unknown_locally() {
        let client = Principal::client(2);
        assert_eq!(client.access(Dimension::Networks).permits(5), None);
        assert!(!client.all_allowed(Dimension::Networks));
    }

    #[test]
    fn principal_round_trips_through_json() {
        let client = Principal::client(3).with_device_types([1, 2]);
        let json = serde_json::to_string(&client).unwrap();
        let back: Principal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, client);
    }
}
