// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contracts of the external collaborators the engine calls into.
//!
//! Entity persistence and event storage live outside this crate. The engine
//! only needs the operations below; [`RpcBackend`](crate::rpc::RpcBackend)
//! implements both traits over the RPC gateway, and tests use in-memory fakes.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::Result;
use crate::filter::Filter;
use crate::model::{
    CommandUpdate, DeviceCommand, DeviceInfo, DeviceNotification, DeviceTypeInfo, Event,
    EventKind, NetworkInfo, SubscriptionId,
};

/// Criteria for listing networks or device types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCriteria {
    /// Restrict the listing to these ids.
    pub ids: Option<BTreeSet<i64>>,
    /// Restrict the listing to what this principal may see.
    pub principal: Option<Principal>,
}

impl ListCriteria {
    /// Lists everything the principal may see.
    #[must_use]
    pub fn visible_to(principal: &Principal) -> Self {
        Self {
            ids: None,
            principal: Some(principal.clone()),
        }
    }

    /// Lists the given ids regardless of permissions.
    #[must_use]
    pub fn ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            principal: None,
        }
    }
}

/// Entity query service.
#[async_trait]
pub trait EntityQuery: Send + Sync {
    /// Returns the devices among `ids` that exist and, when `principal` is
    /// given, that the principal may access.
    async fn find_devices(
        &self,
        ids: &[String],
        principal: Option<&Principal>,
    ) -> Result<Vec<DeviceInfo>>;

    /// Lists networks matching `criteria`.
    async fn list_networks(&self, criteria: &ListCriteria) -> Result<Vec<NetworkInfo>>;

    /// Lists device types matching `criteria`.
    async fn list_device_types(&self, criteria: &ListCriteria) -> Result<Vec<DeviceTypeInfo>>;
}

/// A historical query issued at subscribe time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// Which stream to search.
    pub kind: EventKind,
    /// Scope of the subscription; an event qualifies if any filter matches.
    pub filters: Vec<Filter>,
    /// Exclusive lower bound on the event timestamp.
    pub since: DateTime<Utc>,
    /// Maximum number of events to return.
    pub limit: usize,
}

/// Event persistence.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists a command and returns it with its authoritative id.
    async fn insert_command(&self, command: DeviceCommand) -> Result<DeviceCommand>;

    /// Persists a notification and returns it with its authoritative id.
    async fn insert_notification(&self, notification: DeviceNotification)
    -> Result<DeviceNotification>;

    /// Applies an update to a stored command and returns the updated command.
    async fn update_command(
        &self,
        device_id: &str,
        command_id: i64,
        update: CommandUpdate,
    ) -> Result<DeviceCommand>;

    /// Looks up a single command.
    async fn find_command(&self, device_id: &str, command_id: i64)
    -> Result<Option<DeviceCommand>>;

    /// Returns matching events newer than `query.since`, oldest first.
    async fn find_history(&self, query: &HistoryQuery) -> Result<Vec<Event>>;

    /// Tells the backend that these subscriptions no longer exist.
    async fn release_subscriptions(&self, ids: &[SubscriptionId]) -> Result<()>;
}
