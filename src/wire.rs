// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON messages written to client connections.
//!
//! Each message is an object tagged by `action`:
//!
//! ```json
//! {"action":"notification/insert","subscriptionId":"…","notification":{…}}
//! {"action":"error","status":"error","code":403,"error":"forbidden: …"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DeviceCommand, DeviceNotification, Event, SubscriptionId};

/// Outbound message for a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A new command.
    #[serde(rename = "command/insert")]
    CommandInsert {
        /// Subscription the command was delivered for.
        subscription_id: SubscriptionId,
        /// The command.
        command: DeviceCommand,
    },

    /// A command was updated.
    #[serde(rename = "command/update")]
    CommandUpdate {
        /// Subscription the update was delivered for.
        subscription_id: SubscriptionId,
        /// The updated command.
        command: DeviceCommand,
    },

    /// A new notification.
    #[serde(rename = "notification/insert")]
    NotificationInsert {
        /// Subscription the notification was delivered for.
        subscription_id: SubscriptionId,
        /// The notification.
        notification: DeviceNotification,
    },

    /// A request failed.
    #[serde(rename = "error")]
    Error {
        /// Always `"error"`.
        status: String,
        /// HTTP-style status code.
        code: u16,
        /// Failure description.
        error: String,
    },
}

impl ServerMessage {
    /// Wraps an event for delivery on `subscription_id`.
    #[must_use]
    pub fn for_event(subscription_id: SubscriptionId, event: &Event) -> Self {
        match event {
            Event::Command(command) => Self::CommandInsert {
                subscription_id,
                command: command.clone(),
            },
            Event::CommandUpdate(command) => Self::CommandUpdate {
                subscription_id,
                command: command.clone(),
            },
            Event::Notification(notification) => Self::NotificationInsert {
                subscription_id,
                notification: notification.clone(),
            },
        }
    }

    /// Renders an error response.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self::Error {
            status: "error".to_string(),
            code: error.status_code(),
            error: error.to_string(),
        }
    }

    /// Returns the subscription an event message belongs to.
    #[must_use]
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            Self::CommandInsert {
                subscription_id, ..
            }
            | Self::CommandUpdate {
                subscription_id, ..
            }
            | Self::NotificationInsert {
                subscription_id, ..
            } => Some(*subscription_id),
            Self::Error { .. } => None,
        }
    }

    /// Returns the event carried by the message, if any.
    #[must_use]
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::CommandInsert { command, .. } => Some(Event::Command(command)),
            Self::CommandUpdate { command, .. } => Some(Event::CommandUpdate(command)),
            Self::NotificationInsert { notification, .. } => {
                Some(Event::Notification(notification))
            }
            Self::Error { .. } => None,
        }
    }

    /// Parses a message written by [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if `json` is not a server message.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
