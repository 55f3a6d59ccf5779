// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands, notifications and the events built from them.
//!
//! A [`DeviceCommand`] travels from a client to a device, a
//! [`DeviceNotification`] from a device to its clients. Once persisted, each
//! becomes an [`Event`] whose [`EventScope`] is what subscriptions match on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeviceInfo;

/// The three independent event streams a connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A command was inserted for a device.
    Command,
    /// A previously inserted command was updated by the device.
    CommandUpdate,
    /// A device sent a notification.
    Notification,
}

impl EventKind {
    /// All kinds, in a fixed order.
    pub const ALL: [EventKind; 3] = [Self::Command, Self::CommandUpdate, Self::Notification];

    /// Returns the kind's wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::CommandUpdate => "command_update",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command addressed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    /// Identifier assigned by the persistence layer.
    pub id: i64,
    /// Command name (the sub-topic subscriptions filter on).
    pub command: String,
    /// Target device.
    pub device_id: String,
    /// Network of the target device.
    pub network_id: Option<i64>,
    /// Device type of the target device.
    pub device_type_id: Option<i64>,
    /// Time the command was created.
    pub timestamp: DateTime<Utc>,
    /// Time of the latest update.
    pub last_updated: DateTime<Utc>,
    /// User who issued the command.
    pub user_id: Option<i64>,
    /// Free-form command parameters.
    pub parameters: Option<Value>,
    /// Lifetime in seconds.
    pub lifetime: Option<i32>,
    /// Execution status reported by the device.
    pub status: Option<String>,
    /// Execution result reported by the device.
    pub result: Option<Value>,
    /// Whether the device has updated this command.
    #[serde(default)]
    pub is_updated: bool,
}

/// A notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNotification {
    /// Identifier assigned by the persistence layer.
    pub id: i64,
    /// Notification name (the sub-topic subscriptions filter on).
    pub notification: String,
    /// Source device.
    pub device_id: String,
    /// Network of the source device.
    pub network_id: Option<i64>,
    /// Device type of the source device.
    pub device_type_id: Option<i64>,
    /// Time the notification was produced.
    pub timestamp: DateTime<Utc>,
    /// Free-form notification parameters.
    pub parameters: Option<Value>,
}

/// Caller-supplied fields of a new command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDraft {
    /// Command name.
    pub command: String,
    /// Explicit timestamp; defaults to the insert time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Issuing user.
    pub user_id: Option<i64>,
    /// Free-form parameters.
    pub parameters: Option<Value>,
    /// Lifetime in seconds.
    pub lifetime: Option<i32>,
    /// Initial status.
    pub status: Option<String>,
    /// Initial result.
    pub result: Option<Value>,
}

impl CommandDraft {
    /// Creates a draft with only the command name set.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the command parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Sets an explicit timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the command for `device`, stamping scope fields from it.
    ///
    /// The id is left at zero; the persistence layer assigns the real one.
    #[must_use]
    pub fn into_command(self, device: &DeviceInfo, now: DateTime<Utc>) -> DeviceCommand {
        let timestamp = self.timestamp.unwrap_or(now);
        DeviceCommand {
            id: 0,
            command: self.command,
            device_id: device.device_id.clone(),
            network_id: device.network_id,
            device_type_id: device.device_type_id,
            timestamp,
            last_updated: timestamp,
            user_id: self.user_id,
            parameters: self.parameters,
            lifetime: self.lifetime,
            status: self.status,
            result: self.result,
            is_updated: false,
        }
    }
}

/// Caller-supplied fields of a new notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDraft {
    /// Notification name.
    pub notification: String,
    /// Explicit timestamp; defaults to the insert time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form parameters.
    pub parameters: Option<Value>,
}

impl NotificationDraft {
    /// Creates a draft with only the notification name set.
    #[must_use]
    pub fn new(notification: impl Into<String>) -> Self {
        Self {
            notification: notification.into(),
            ..Self::default()
        }
    }

    /// Sets the notification parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Sets an explicit timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the notification for `device`, stamping scope fields from it.
    #[must_use]
    pub fn into_notification(self, device: &DeviceInfo, now: DateTime<Utc>) -> DeviceNotification {
        DeviceNotification {
            id: 0,
            notification: self.notification,
            device_id: device.device_id.clone(),
            network_id: device.network_id,
            device_type_id: device.device_type_id,
            timestamp: self.timestamp.unwrap_or(now),
            parameters: self.parameters,
        }
    }
}

/// Status and result reported by a device for one of its commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandUpdate {
    /// New status, if changed.
    pub status: Option<String>,
    /// New result, if changed.
    pub result: Option<Value>,
}

impl CommandUpdate {
    /// Applies the update to `command`, marking it as updated at `now`.
    pub fn apply_to(self, command: &mut DeviceCommand, now: DateTime<Utc>) {
        command.is_updated = true;
        command.last_updated = now;
        if let Some(status) = self.status {
            command.status = Some(status);
        }
        if let Some(result) = self.result {
            command.result = Some(result);
        }
    }
}

/// The scoping fields of a published event.
///
/// This is what [`Filter`](crate::filter::Filter)s are matched against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventScope {
    /// Which stream the event belongs to.
    pub kind: EventKind,
    /// Network of the device.
    pub network_id: Option<i64>,
    /// Device type of the device.
    pub device_type_id: Option<i64>,
    /// The device.
    pub device_id: String,
    /// Command or notification name.
    pub name: String,
    /// Command id, for command and command-update events.
    pub command_id: Option<i64>,
}

/// A persisted command, command update or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// A command was inserted.
    Command(DeviceCommand),
    /// A command was updated.
    CommandUpdate(DeviceCommand),
    /// A notification was inserted.
    Notification(DeviceNotification),
}

impl Event {
    /// Returns the event's stream.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Command(_) => EventKind::Command,
            Self::CommandUpdate(_) => EventKind::CommandUpdate,
            Self::Notification(_) => EventKind::Notification,
        }
    }

    /// Returns the persisted id.
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Command(c) | Self::CommandUpdate(c) => c.id,
            Self::Notification(n) => n.id,
        }
    }

    /// Returns the event's ordering timestamp.
    ///
    /// Command updates are ordered by their last update time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Command(c) => c.timestamp,
            Self::CommandUpdate(c) => c.last_updated,
            Self::Notification(n) => n.timestamp,
        }
    }

    /// Returns the device the event belongs to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Command(c) | Self::CommandUpdate(c) => &c.device_id,
            Self::Notification(n) => &n.device_id,
        }
    }

    /// Returns the scoping fields used for subscription matching.
    #[must_use]
    pub fn scope(&self) -> EventScope {
        match self {
            Self::Command(c) | Self::CommandUpdate(c) => EventScope {
                kind: self.kind(),
                network_id: c.network_id,
                device_type_id: c.device_type_id,
                device_id: c.device_id.clone(),
                name: c.command.clone(),
                command_id: Some(c.id),
            },
            Self::Notification(n) => EventScope {
                kind: EventKind::Notification,
                network_id: n.network_id,
                device_type_id: n.device_type_id,
                device_id: n.device_id.clone(),
                name: n.notification.clone(),
                command_id: None,
            },
        }
    }
}
