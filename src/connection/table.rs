// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lookup of live connections by id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::model::ConnectionId;

use super::ConnectionState;

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
}

impl ConnectionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection.
    pub fn insert(&self, state: Arc<ConnectionState>) {
        self.connections.insert(state.id(), state);
    }

    /// Returns the connection with `id`.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the connection with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if it is not registered.
    pub fn require(&self, id: ConnectionId) -> Result<Arc<ConnectionState>> {
        self.get(id).ok_or(Error::ConnectionNotFound(id))
    }

    /// Removes a connection, returning it if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.remove(&id).map(|(_, state)| state)
    }

    /// Returns the ids of every live connection.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
