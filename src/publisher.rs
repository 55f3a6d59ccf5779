// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence and fan-out of published events.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::backend::EventStore;
use crate::connection::{ConnectionState, ConnectionTable};
use crate::error::{Result, TransportError};
use crate::model::{
    CommandUpdate, ConnectionId, DeviceCommand, DeviceNotification, Event, SubscriptionId,
};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::wire::ServerMessage;

/// Outcome of fanning one event out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Subscriptions the event was enqueued for.
    pub delivered: usize,
    /// Distinct connections the event was enqueued on.
    pub connections: usize,
    /// One-shot subscriptions consumed by this event.
    pub consumed: Vec<(ConnectionId, SubscriptionId)>,
    /// Connections whose transport failed while flushing.
    pub failed: Vec<(ConnectionId, TransportError)>,
}

/// Persists events and delivers them to matching subscriptions.
///
/// Each matching connection gets the event enqueued once per matching
/// subscription, then all affected connections are flushed concurrently. A
/// transport failure on one connection is reported in [`FanOut::failed`] and
/// does not affect the others; closing the failed connection is up to the
/// caller.
#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionTable>,
    store: Arc<dyn EventStore>,
}

impl EventPublisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<ConnectionTable>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            registry,
            connections,
            store,
        }
    }

    /// Persists a command and delivers it.
    ///
    /// # Errors
    ///
    /// Returns the store's error; nothing is delivered in that case.
    pub async fn insert_command(&self, command: DeviceCommand) -> Result<(DeviceCommand, FanOut)> {
        let command = self.store.insert_command(command).await?;
        let fan_out = self.fan_out(&Event::Command(command.clone())).await;
        Ok((command, fan_out))
    }

    /// Persists a notification and delivers it.
    ///
    /// # Errors
    ///
    /// Returns the store's error; nothing is delivered in that case.
    pub async fn insert_notification(
        &self,
        notification: DeviceNotification,
    ) -> Result<(DeviceNotification, FanOut)> {
        let notification = self.store.insert_notification(notification).await?;
        let fan_out = self
            .fan_out(&Event::Notification(notification.clone()))
            .await;
        Ok((notification, fan_out))
    }

    /// Persists a command update and delivers the updated command.
    ///
    /// # Errors
    ///
    /// Returns the store's error; nothing is delivered in that case.
    pub async fn update_command(
        &self,
        device_id: &str,
        command_id: i64,
        update: CommandUpdate,
    ) -> Result<(DeviceCommand, FanOut)> {
        let command = self
            .store
            .update_command(device_id, command_id, update)
            .await?;
        let fan_out = self
            .fan_out(&Event::CommandUpdate(command.clone()))
            .await;
        Ok((command, fan_out))
    }

    /// Delivers an already persisted event to every matching subscription.
    pub async fn fan_out(&self, event: &Event) -> FanOut {
        let scope = event.scope();
        let matched = self.registry.matching(&scope);

        let mut by_connection: BTreeMap<ConnectionId, Vec<Arc<Subscription>>> = BTreeMap::new();
        for subscription in matched {
            by_connection
                .entry(subscription.connection())
                .or_default()
                .push(subscription);
        }

        let mut report = FanOut::default();
        let mut to_flush = Vec::with_capacity(by_connection.len());

        for (connection_id, subscriptions) in by_connection {
            let Some(state) = self.connections.get(connection_id) else {
                tracing::debug!(connection = %connection_id, "Skipping subscriptions of unknown connection");
                continue;
            };

            let mut enqueued = 0;
            for subscription in subscriptions {
                if !subscription.claim() {
                    continue;
                }
                if enqueue(&state, subscription.id(), event) {
                    enqueued += 1;
                }
                if subscription.is_one_shot()
                    && state.unsubscribe(&self.registry, subscription.kind(), subscription.id())
                {
                    report.consumed.push((connection_id, subscription.id()));
                }
            }

            if enqueued > 0 {
                report.delivered += enqueued;
                report.connections += 1;
                to_flush.push(state);
            }
        }

        report.failed = flush_all(to_flush).await;

        tracing::debug!(
            kind = %event.kind(),
            id = event.id(),
            device = %event.device_id(),
            delivered = report.delivered,
            connections = report.connections,
            failed = report.failed.len(),
            "Fanned out event"
        );
        report
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscriptions", &self.registry.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// Serializes `event` for `subscription` and queues it on `state`.
pub(crate) fn enqueue(state: &ConnectionState, subscription: SubscriptionId, event: &Event) -> bool {
    match ServerMessage::for_event(subscription, event).to_json() {
        Ok(message) => state.dispatcher().enqueue_for(subscription, message),
        Err(e) => {
            tracing::warn!(
                connection = %state.id(),
                subscription = %subscription,
                error = %e,
                "Failed to serialize event"
            );
            false
        }
    }
}

/// Flushes every connection concurrently, returning the ones that failed.
pub(crate) async fn flush_all(
    states: Vec<Arc<ConnectionState>>,
) -> Vec<(ConnectionId, TransportError)> {
    let mut failed = Vec::new();
    if states.len() == 1 {
        for state in states {
            if let Err(e) = state.dispatcher().flush().await {
                failed.push((state.id(), e));
            }
        }
        return failed;
    }

    let mut tasks = JoinSet::new();
    for state in states {
        tasks.spawn(async move { (state.id(), state.dispatcher().flush().await) });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((id, Err(e))) => failed.push((id, e)),
            Err(e) => tracing::error!(error = %e, "Flush task failed"),
        }
    }
    failed
}
