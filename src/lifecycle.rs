// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broadcast of hub lifecycle events to observers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ConnectionId, EventKind, SubscriptionId};

/// Default channel capacity for the lifecycle bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a connection or subscription.
///
/// # Examples
///
/// ```
/// use hivebus::lifecycle::HubEvent;
/// use hivebus::model::ConnectionId;
///
/// let connection = ConnectionId::next();
/// let event = HubEvent::ConnectionOpened { connection, user_id: Some(1) };
/// assert_eq!(event.connection(), connection);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    /// A connection was registered.
    ConnectionOpened {
        /// The connection.
        connection: ConnectionId,
        /// Authenticated user, if any.
        user_id: Option<i64>,
    },

    /// A connection was closed and its subscriptions removed.
    ConnectionClosed {
        /// The connection.
        connection: ConnectionId,
        /// Number of subscriptions removed.
        subscriptions: usize,
    },

    /// A subscription was created.
    Subscribed {
        /// Owning connection.
        connection: ConnectionId,
        /// The subscription.
        subscription: SubscriptionId,
        /// Subscribed stream.
        kind: EventKind,
    },

    /// A subscription was removed, explicitly or after its one-shot delivery.
    Unsubscribed {
        /// Owning connection.
        connection: ConnectionId,
        /// The subscription.
        subscription: SubscriptionId,
        /// Subscribed stream.
        kind: EventKind,
    },

    /// Writing to a connection failed; it is being closed.
    TransportFailed {
        /// The connection.
        connection: ConnectionId,
        /// Failure description.
        error: String,
    },
}

impl HubEvent {
    /// Returns the connection the event concerns.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::ConnectionOpened { connection, .. }
            | Self::ConnectionClosed { connection, .. }
            | Self::Subscribed { connection, .. }
            | Self::Unsubscribed { connection, .. }
            | Self::TransportFailed { connection, .. } => *connection,
        }
    }
}

/// Broadcast channel of [`HubEvent`]s.
///
/// Publishing never blocks. A slow observer that falls more than the channel
/// capacity behind loses the oldest events (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    sender: broadcast::Sender<HubEvent>,
}

impl LifecycleBus {
    /// Creates a bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` events per observer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event; discarded if nobody is listening.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}
