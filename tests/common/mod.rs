// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures: an in-memory backend and transport helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hivebus::auth::{Access, Principal};
use hivebus::backend::{EntityQuery, EventStore, HistoryQuery, ListCriteria};
use hivebus::connection::Transport;
use hivebus::error::{Error, Result, RpcError, TransportError};
use hivebus::model::{
    CommandUpdate, DeviceCommand, DeviceInfo, DeviceNotification, DeviceTypeInfo, Event,
    EventKind, NetworkInfo, SubscriptionId,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// In-memory entity catalog and event store.
///
/// Seeded with networks 5 and 6, device types 1 and 2, and devices:
/// - `D1`: network 5, type 1
/// - `D2`: network 6, type 2
/// - `D3`: network 5, type 2
/// - `ORPHAN`: no network
pub struct FakeBackend {
    devices: Mutex<HashMap<String, DeviceInfo>>,
    networks: BTreeMap<i64, String>,
    device_types: BTreeMap<i64, String>,
    /// Networks granted to users with delegated access.
    grants: Mutex<HashMap<i64, BTreeSet<i64>>>,
    commands: Mutex<Vec<DeviceCommand>>,
    notifications: Mutex<Vec<DeviceNotification>>,
    next_id: AtomicI64,
    released: Mutex<Vec<SubscriptionId>>,
    fail_history: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        let devices = [
            DeviceInfo::new("D1").with_network(5).with_device_type(1),
            DeviceInfo::new("D2").with_network(6).with_device_type(2),
            DeviceInfo::new("D3").with_network(5).with_device_type(2),
            DeviceInfo::new("ORPHAN"),
        ]
        .into_iter()
        .map(|d| (d.device_id.clone(), d))
        .collect();

        Self {
            devices: Mutex::new(devices),
            networks: [(5, "home".to_string()), (6, "office".to_string())].into(),
            device_types: [(1, "sensor".to_string()), (2, "relay".to_string())].into(),
            grants: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            released: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Grants networks to a user whose access is delegated.
    pub fn grant(&self, user_id: i64, networks: impl IntoIterator<Item = i64>) {
        self.grants
            .lock()
            .entry(user_id)
            .or_default()
            .extend(networks);
    }

    /// Makes the next history queries fail.
    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Stores a notification directly, bypassing the hub.
    pub fn seed_notification(&self, mut notification: DeviceNotification) -> DeviceNotification {
        notification.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.notifications.lock().push(notification.clone());
        notification
    }

    /// Stores a command directly, bypassing the hub.
    pub fn seed_command(&self, mut command: DeviceCommand) -> DeviceCommand {
        command.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().push(command.clone());
        command
    }

    pub fn released(&self) -> Vec<SubscriptionId> {
        self.released.lock().clone()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.lock().len()
    }

    fn network_visible(&self, principal: &Principal, network_id: i64) -> bool {
        match &principal.networks {
            Access::All => true,
            Access::Listed(ids) => ids.contains(&network_id),
            Access::Delegated => principal
                .user_id
                .and_then(|user| self.grants.lock().get(&user).cloned())
                .is_some_and(|ids| ids.contains(&network_id)),
        }
    }

    fn device_type_visible(principal: &Principal, device_type_id: i64) -> bool {
        match &principal.device_types {
            Access::All | Access::Delegated => true,
            Access::Listed(ids) => ids.contains(&device_type_id),
        }
    }

    fn device_visible(&self, principal: &Principal, device: &DeviceInfo) -> bool {
        let network_ok = match device.network_id {
            Some(network) => self.network_visible(principal, network),
            None => matches!(principal.networks, Access::All),
        };
        let type_ok = device
            .device_type_id
            .is_none_or(|t| Self::device_type_visible(principal, t));
        network_ok && type_ok
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn in_criteria(criteria: &ListCriteria, id: i64) -> bool {
    criteria.ids.as_ref().is_none_or(|ids| ids.contains(&id))
}

#[async_trait]
impl EntityQuery for FakeBackend {
    async fn find_devices(
        &self,
        ids: &[String],
        principal: Option<&Principal>,
    ) -> Result<Vec<DeviceInfo>> {
        let devices = self.devices.lock();
        Ok(ids
            .iter()
            .filter_map(|id| devices.get(id))
            .filter(|device| principal.is_none_or(|p| self.device_visible(p, device)))
            .cloned()
            .collect())
    }

    async fn list_networks(&self, criteria: &ListCriteria) -> Result<Vec<NetworkInfo>> {
        Ok(self
            .networks
            .iter()
            .filter(|(id, _)| in_criteria(criteria, **id))
            .filter(|(id, _)| {
                criteria
                    .principal
                    .as_ref()
                    .is_none_or(|p| self.network_visible(p, **id))
            })
            .map(|(id, name)| NetworkInfo {
                id: *id,
                name: name.clone(),
            })
            .collect())
    }

    async fn list_device_types(&self, criteria: &ListCriteria) -> Result<Vec<DeviceTypeInfo>> {
        Ok(self
            .device_types
            .iter()
            .filter(|(id, _)| in_criteria(criteria, **id))
            .filter(|(id, _)| {
                criteria
                    .principal
                    .as_ref()
                    .is_none_or(|p| Self::device_type_visible(p, **id))
            })
            .map(|(id, name)| DeviceTypeInfo {
                id: *id,
                name: name.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for FakeBackend {
    async fn insert_command(&self, command: DeviceCommand) -> Result<DeviceCommand> {
        Ok(self.seed_command(command))
    }

    async fn insert_notification(
        &self,
        notification: DeviceNotification,
    ) -> Result<DeviceNotification> {
        Ok(self.seed_notification(notification))
    }

    async fn update_command(
        &self,
        device_id: &str,
        command_id: i64,
        update: CommandUpdate,
    ) -> Result<DeviceCommand> {
        let mut commands = self.commands.lock();
        let command = commands
            .iter_mut()
            .find(|c| c.id == command_id && c.device_id == device_id)
            .ok_or_else(|| Error::NotFound(format!("command {command_id} not found")))?;
        update.apply_to(command, Utc::now());
        Ok(command.clone())
    }

    async fn find_command(&self, device_id: &str, command_id: i64) -> Result<Option<DeviceCommand>> {
        Ok(self
            .commands
            .lock()
            .iter()
            .find(|c| c.id == command_id && c.device_id == device_id)
            .cloned())
    }

    async fn find_history(&self, query: &HistoryQuery) -> Result<Vec<Event>> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout(10).into());
        }
        let events: Vec<Event> = match query.kind {
            EventKind::Command => self.commands.lock().iter().cloned().map(Event::Command).collect(),
            EventKind::CommandUpdate => self
                .commands
                .lock()
                .iter()
                .filter(|c| c.is_updated)
                .cloned()
                .map(Event::CommandUpdate)
                .collect(),
            EventKind::Notification => self
                .notifications
                .lock()
                .iter()
                .cloned()
                .map(Event::Notification)
                .collect(),
        };
        let mut events: Vec<Event> = events
            .into_iter()
            .filter(|e| e.timestamp() > query.since)
            .filter(|e| {
                let scope = e.scope();
                query.filters.iter().any(|f| f.matches(&scope))
            })
            .collect();
        events.sort_by_key(Event::timestamp);
        events.truncate(query.limit);
        Ok(events)
    }

    async fn release_subscriptions(&self, ids: &[SubscriptionId]) -> Result<()> {
        self.released.lock().extend_from_slice(ids);
        Ok(())
    }
}

/// A transport whose writes always fail.
pub struct BrokenTransport;

#[async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _message: &str) -> std::result::Result<(), TransportError> {
        Err(TransportError::WriteFailed("connection reset".into()))
    }
}

/// Drains every message currently buffered on a connection's channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(serde_json::from_str(&message).expect("outbound message is JSON"));
    }
    out
}

/// Receives one message, failing the test after a second.
pub async fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    serde_json::from_str(&message).expect("outbound message is JSON")
}

/// Waits until the backend has been told about `count` released subscriptions.
pub async fn wait_for_release(backend: &FakeBackend, count: usize) -> Vec<SubscriptionId> {
    for _ in 0..100 {
        let released = backend.released();
        if released.len() >= count {
            return released;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    backend.released()
}

/// A timestamp offset from `base` by `seconds`.
pub fn at(base: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    base + chrono::Duration::seconds(seconds)
}
