// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The subscription hub: the surface the connection-handling layer talks to.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use crate::auth::Principal;
use crate::backend::{EntityQuery, EventStore};
use crate::config::HubConfig;
use crate::connection::{
    ChannelTransport, ConnectionState, ConnectionTable, DeliveryDispatcher, LegacyKey, Transport,
};
use crate::error::{Error, Result, TransportError, ValidationError};
use crate::filter::{Filter, FilterBuilder, SubscribeParams};
use crate::lifecycle::{HubEvent, LifecycleBus};
use crate::model::{
    CommandDraft, CommandUpdate, ConnectionId, DeviceCommand, DeviceInfo, DeviceNotification,
    Event, EventKind, NotificationDraft, SubscriptionId,
};
use crate::publisher::{self, EventPublisher, FanOut};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::replay::ReplayCoordinator;
use crate::wire::ServerMessage;

/// A subscribe call.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use hivebus::SubscribeRequest;
/// use hivebus::filter::SubscribeParams;
/// use hivebus::model::EventKind;
///
/// let request = SubscribeRequest::new(EventKind::Notification)
///     .with_params(SubscribeParams::new().device("D1").names(["temp"]))
///     .replay_since(Utc::now())
///     .with_limit(20);
/// assert_eq!(request.limit, Some(20));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Stream to subscribe to.
    pub kind: EventKind,
    /// Scoping parameters.
    pub params: SubscribeParams,
    /// Replay stored events newer than this.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of replayed events.
    pub limit: Option<usize>,
    /// For command subscriptions, also deliver updates of matching commands
    /// under the same subscription id.
    pub return_updated: bool,
}

impl SubscribeRequest {
    /// Subscribes to everything of `kind` the caller may see.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            params: SubscribeParams::default(),
            since: None,
            limit: None,
            return_updated: false,
        }
    }

    /// Sets the scoping parameters.
    #[must_use]
    pub fn with_params(mut self, params: SubscribeParams) -> Self {
        self.params = params;
        self
    }

    /// Requests replay of events newer than `since`.
    #[must_use]
    pub fn replay_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Caps the number of replayed events.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Also delivers updates of the matched commands.
    ///
    /// Ignored unless [`kind`](Self::kind) is [`EventKind::Command`].
    #[must_use]
    pub fn with_command_updates(mut self) -> Self {
        self.return_updated = true;
        self
    }

    /// Returns `true` if command updates ride along on this subscription.
    #[must_use]
    pub fn follows_updates(&self) -> bool {
        self.kind == EventKind::Command && self.return_updated
    }
}

/// Hub-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Distinct filter keys in the index.
    pub filter_keys: usize,
    /// Lifecycle observers.
    pub observers: usize,
}

/// Ties filter building, the registry, connections, replay and fan-out
/// together.
///
/// # Examples
///
/// ```ignore
/// let hub = SubscriptionHub::from_backend(backend);
/// let (transport, mut outbound) = ChannelTransport::pair();
/// let conn = hub.open_connection(Principal::admin(1), transport);
///
/// let sub = hub
///     .subscribe(conn, &SubscribeRequest::new(EventKind::Notification))
///     .await?;
/// hub.publish_notification(&Principal::admin(1), "D1", NotificationDraft::new("temp"))
///     .await?;
/// let json = outbound.recv().await;
/// ```
pub struct SubscriptionHub {
    config: HubConfig,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionTable>,
    filters: FilterBuilder,
    store: Arc<dyn EventStore>,
    replay: ReplayCoordinator,
    publisher: EventPublisher,
    lifecycle: LifecycleBus,
}

impl SubscriptionHub {
    /// Creates a hub with default configuration.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityQuery>, store: Arc<dyn EventStore>) -> Self {
        Self::with_config(entities, store, HubConfig::default())
    }

    /// Creates a hub over one backend serving both collaborator roles.
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EntityQuery + EventStore + 'static,
    {
        let entities: Arc<dyn EntityQuery> = Arc::clone(&backend) as Arc<dyn EntityQuery>;
        let store: Arc<dyn EventStore> = backend;
        Self::new(entities, store)
    }

    /// Creates a hub with the given configuration.
    #[must_use]
    pub fn with_config(
        entities: Arc<dyn EntityQuery>,
        store: Arc<dyn EventStore>,
        config: HubConfig,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        Self {
            filters: FilterBuilder::new(entities),
            replay: ReplayCoordinator::new(Arc::clone(&store)),
            publisher: EventPublisher::new(
                Arc::clone(&registry),
                Arc::clone(&connections),
                Arc::clone(&store),
            ),
            lifecycle: LifecycleBus::with_capacity(config.lifecycle_capacity),
            store,
            registry,
            connections,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Returns the shared subscription index.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Returns the state of a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(id)
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<HubEvent> {
        self.lifecycle.subscribe()
    }

    /// Returns hub-wide counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        HubStats {
            connections: self.connections.len(),
            subscriptions: registry.subscriptions,
            filter_keys: registry.filter_keys,
            observers: self.lifecycle.observer_count(),
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Registers a newly authenticated connection writing to `transport`.
    pub fn open_connection<T>(&self, principal: Principal, transport: T) -> ConnectionId
    where
        T: Transport + 'static,
    {
        let id = ConnectionId::next();
        let user_id = principal.user_id;
        let dispatcher = DeliveryDispatcher::new(id, Box::new(transport));
        self.connections
            .insert(Arc::new(ConnectionState::new(id, principal, dispatcher)));

        tracing::debug!(connection = %id, user = ?user_id, "Connection opened");
        self.lifecycle.publish(HubEvent::ConnectionOpened {
            connection: id,
            user_id,
        });
        id
    }

    /// Closes a connection and removes all of its subscriptions.
    ///
    /// The backend is told about the removed subscriptions in the background.
    /// Returns `false` if the connection was not registered.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        let Some(state) = self.connections.remove(id) else {
            return false;
        };
        let removed = state.on_close(&self.registry);
        let count = removed.len();
        self.release(removed);

        tracing::debug!(connection = %id, subscriptions = count, "Connection closed");
        self.lifecycle.publish(HubEvent::ConnectionClosed {
            connection: id,
            subscriptions: count,
        });
        true
    }

    /// Writes whatever is queued for a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] for unknown connections and
    /// [`Error::Transport`] if the write fails, in which case the connection
    /// is closed.
    pub async fn flush(&self, id: ConnectionId) -> Result<usize> {
        let state = self.connections.require(id)?;
        self.flush_state(&state).await
    }

    async fn flush_state(&self, state: &ConnectionState) -> Result<usize> {
        match state.dispatcher().flush().await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                self.transport_failed(state.id(), &e).await;
                Err(e.into())
            }
        }
    }

    async fn transport_failed(&self, id: ConnectionId, error: &TransportError) {
        tracing::warn!(connection = %id, error = %error, "Closing connection after transport failure");
        self.lifecycle.publish(HubEvent::TransportFailed {
            connection: id,
            error: error.to_string(),
        });
        self.close_connection(id).await;
    }

    /// Tells the backend, without waiting, that subscriptions are gone.
    fn release(&self, ids: Vec<SubscriptionId>) {
        if ids.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.release_subscriptions(&ids).await {
                tracing::warn!(
                    subscriptions = ids.len(),
                    error = %e,
                    "Failed to release subscriptions in backend"
                );
            }
        });
    }

    // =========================================================================
    // Subscribe / unsubscribe
    // =========================================================================

    /// Subscribes a connection and optionally replays history.
    ///
    /// Replayed events are queued after the subscription is registered, so a
    /// live event published in between may be delivered twice. If the replay
    /// fails, anything still queued for the new subscription is withdrawn
    /// together with the subscription itself; a live event already written
    /// to the transport in that window carries an id the caller never sees
    /// and should be ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for malformed parameters or a zero limit.
    /// - [`Error::NotFound`] / [`Error::Forbidden`] from filter building.
    /// - [`Error::ConnectionNotFound`] if the connection is not open.
    /// - Backend errors from the history query; the subscription is then
    ///   removed again.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        request: &SubscribeRequest,
    ) -> Result<SubscriptionId> {
        let state = self.connections.require(connection)?;
        let filters = self.subscription_filters(&state, request).await?;
        let subscription = self.register(&state, request.kind, filters, None)?;

        if let Some(since) = request.since {
            let limit = self.config.replay_limit(request.limit);
            if let Err(e) = self.replay.replay(&state, &subscription, since, limit).await {
                tracing::warn!(
                    connection = %connection,
                    subscription = %subscription.id(),
                    error = %e,
                    "Replay failed, removing subscription"
                );
                self.roll_back(&state, request.kind, subscription.id());
                return Err(e);
            }
        }

        self.flush_state(&state).await?;
        Ok(subscription.id())
    }

    /// Answers a long-poll request.
    ///
    /// Subscribes on a transient connection and looks for stored events
    /// newer than `request.since`, which defaults to now. Stored events are
    /// returned at once; otherwise the call waits up to `wait` for live
    /// events and returns the first batch, or nothing at the timeout. The
    /// transient subscription is removed and released in every case.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn poll(
        &self,
        principal: &Principal,
        request: &SubscribeRequest,
        wait: Duration,
    ) -> Result<Vec<Event>> {
        let (transport, mut outbound) = ChannelTransport::pair();
        let connection = self.open_connection(principal.clone(), transport);
        let result = self.poll_on(connection, request, wait, &mut outbound).await;
        self.close_connection(connection).await;

        if let Ok(events) = &result {
            tracing::debug!(
                connection = %connection,
                kind = %request.kind,
                events = events.len(),
                "Poll answered"
            );
        }
        result
    }

    async fn poll_on(
        &self,
        connection: ConnectionId,
        request: &SubscribeRequest,
        wait: Duration,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<Vec<Event>> {
        let state = self.connections.require(connection)?;
        let filters = self.subscription_filters(&state, request).await?;
        let subscription = self.register(&state, request.kind, filters, None)?;

        let since = request.since.unwrap_or_else(Utc::now);
        let limit = self.config.replay_limit(request.limit);
        let stored = self.replay.history(&subscription, since, limit).await?;
        if !stored.is_empty() {
            return Ok(stored);
        }

        let Ok(Some(first)) = tokio::time::timeout(wait, outbound.recv()).await else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        let buffered = std::iter::from_fn(|| outbound.try_recv().ok());
        for message in std::iter::once(first).chain(buffered) {
            if let Some(event) = ServerMessage::from_json(&message)?.into_event() {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Validates a request and builds its authorized filter set.
    async fn subscription_filters(
        &self,
        state: &ConnectionState,
        request: &SubscribeRequest,
    ) -> Result<Vec<Filter>> {
        if request.limit == Some(0) {
            return Err(ValidationError::ZeroLimit.into());
        }
        let mut filters = self
            .filters
            .build(request.kind, &request.params, state.principal())
            .await?;
        if request.follows_updates() {
            let updates: Vec<Filter> = filters
                .iter()
                .map(|f| Filter {
                    kind: EventKind::CommandUpdate,
                    ..f.clone()
                })
                .collect();
            filters.extend(updates);
        }
        Ok(filters)
    }

    /// Subscribes using the legacy device-list convention.
    ///
    /// `None` (or an empty set) means every device the caller may see.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe); a blank device id is a
    /// validation error.
    pub async fn subscribe_legacy(
        &self,
        connection: ConnectionId,
        kind: EventKind,
        device_ids: Option<BTreeSet<String>>,
        names: Option<BTreeSet<String>>,
    ) -> Result<SubscriptionId> {
        let state = self.connections.require(connection)?;
        let key = legacy_key(device_ids)?;

        let filters = if key.is_empty() {
            let params = SubscribeParams {
                names,
                ..SubscribeParams::default()
            };
            self.filters.build(kind, &params, state.principal()).await?
        } else {
            let mut filters = Vec::new();
            for device_id in &key {
                let params = SubscribeParams {
                    device_id: Some(device_id.clone()),
                    names: names.clone(),
                    ..SubscribeParams::default()
                };
                filters.extend(self.filters.build(kind, &params, state.principal()).await?);
            }
            filters
        };

        let subscription = self.register(&state, kind, filters, Some(key))?;
        self.flush_state(&state).await?;
        Ok(subscription.id())
    }

    /// Waits for the next update of one command.
    ///
    /// The subscription is removed after delivering a single update. If the
    /// command has already been updated, that state is delivered at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] / [`Error::Forbidden`] for the device, and
    /// [`Error::NotFound`] if the command does not exist.
    pub async fn subscribe_command_update(
        &self,
        connection: ConnectionId,
        device_id: &str,
        command_id: i64,
    ) -> Result<SubscriptionId> {
        let state = self.connections.require(connection)?;
        if device_id.trim().is_empty() {
            return Err(ValidationError::BlankDeviceId.into());
        }
        let device = self
            .filters
            .resolve_device(device_id, state.principal())
            .await?;

        let subscription = Arc::new(Subscription::one_shot(
            Filter::for_device(EventKind::CommandUpdate, &device),
            command_id,
            state.principal().clone(),
            connection,
        ));
        let id = state.subscribe(&self.registry, Arc::clone(&subscription), None)?;
        self.announce_subscribed(connection, id, EventKind::CommandUpdate);

        let command = match self.store.find_command(device_id, command_id).await {
            Ok(Some(command)) => command,
            Ok(None) => {
                self.roll_back(&state, EventKind::CommandUpdate, id);
                return Err(Error::NotFound(format!(
                    "command {command_id} of device {device_id} not found"
                )));
            }
            Err(e) => {
                self.roll_back(&state, EventKind::CommandUpdate, id);
                return Err(e);
            }
        };

        if command.is_updated && subscription.claim() {
            tracing::debug!(
                connection = %connection,
                subscription = %id,
                command = command_id,
                "Command already updated, delivering immediately"
            );
            publisher::enqueue(&state, id, &Event::CommandUpdate(command));
            self.remove(&state, EventKind::CommandUpdate, id);
        }

        self.flush_state(&state).await?;
        Ok(id)
    }

    /// Removes a subscription.
    ///
    /// Returns `false` if the connection does not own it (for instance
    /// because it was already removed). Messages already queued are still
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection is not open.
    pub async fn unsubscribe(
        &self,
        connection: ConnectionId,
        kind: EventKind,
        id: SubscriptionId,
    ) -> Result<bool> {
        let state = self.connections.require(connection)?;
        let removed = self.remove(&state, kind, id);
        if removed {
            self.release(vec![id]);
        }
        self.flush_state(&state).await?;
        Ok(removed)
    }

    /// Removes every subscription of `kind` held by a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection is not open.
    pub async fn unsubscribe_all(
        &self,
        connection: ConnectionId,
        kind: EventKind,
    ) -> Result<Vec<SubscriptionId>> {
        let state = self.connections.require(connection)?;
        let removed = state.unsubscribe_all(&self.registry, kind);
        for id in &removed {
            self.announce_unsubscribed(connection, *id, kind);
        }
        self.release(removed.clone());
        self.flush_state(&state).await?;
        Ok(removed)
    }

    /// Removes the subscriptions recorded under a legacy device set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection is not open,
    /// or a validation error for a blank device id.
    pub async fn unsubscribe_legacy(
        &self,
        connection: ConnectionId,
        kind: EventKind,
        device_ids: Option<BTreeSet<String>>,
    ) -> Result<Vec<SubscriptionId>> {
        let state = self.connections.require(connection)?;
        let key = legacy_key(device_ids)?;
        let removed = state.unsubscribe_legacy(&self.registry, kind, &key);
        for id in &removed {
            self.announce_unsubscribed(connection, *id, kind);
        }
        self.release(removed.clone());
        self.flush_state(&state).await?;
        Ok(removed)
    }

    fn register(
        &self,
        state: &ConnectionState,
        kind: EventKind,
        filters: Vec<Filter>,
        legacy: Option<LegacyKey>,
    ) -> Result<Arc<Subscription>> {
        let subscription = Arc::new(Subscription::new(
            kind,
            filters,
            state.principal().clone(),
            state.id(),
        ));
        let id = state.subscribe(&self.registry, Arc::clone(&subscription), legacy)?;
        self.announce_subscribed(state.id(), id, kind);
        Ok(subscription)
    }

    fn remove(&self, state: &ConnectionState, kind: EventKind, id: SubscriptionId) -> bool {
        let removed = state.unsubscribe(&self.registry, kind, id);
        if removed {
            self.announce_unsubscribed(state.id(), id, kind);
        }
        removed
    }

    /// Undoes a registration whose subscribe call is failing.
    fn roll_back(&self, state: &ConnectionState, kind: EventKind, id: SubscriptionId) {
        if self.remove(state, kind, id) {
            self.release(vec![id]);
        }
        state.dispatcher().discard(id);
    }

    fn announce_subscribed(&self, connection: ConnectionId, subscription: SubscriptionId, kind: EventKind) {
        self.lifecycle.publish(HubEvent::Subscribed {
            connection,
            subscription,
            kind,
        });
    }

    fn announce_unsubscribed(
        &self,
        connection: ConnectionId,
        subscription: SubscriptionId,
        kind: EventKind,
    ) {
        self.lifecycle.publish(HubEvent::Unsubscribed {
            connection,
            subscription,
            kind,
        });
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Resolves the target device of a publish.
    async fn publish_target(&self, principal: &Principal, device_id: &str) -> Result<DeviceInfo> {
        if device_id.trim().is_empty() {
            return Err(ValidationError::BlankDeviceId.into());
        }
        let device = self.filters.resolve_device(device_id, principal).await?;
        if device.network_id.is_none() {
            return Err(Error::Forbidden(format!(
                "device {device_id} is not assigned to any network"
            )));
        }
        Ok(device)
    }

    /// Sends a command to a device.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank command name, the device
    /// resolution error, or the store's error.
    pub async fn publish_command(
        &self,
        principal: &Principal,
        device_id: &str,
        draft: CommandDraft,
    ) -> Result<DeviceCommand> {
        if draft.command.trim().is_empty() {
            return Err(ValidationError::MissingField("command").into());
        }
        let device = self.publish_target(principal, device_id).await?;
        let mut command = draft.into_command(&device, Utc::now());
        if command.user_id.is_none() {
            command.user_id = principal.user_id;
        }

        let (command, fan_out) = self.publisher.insert_command(command).await?;
        self.settle(EventKind::Command, fan_out).await;
        Ok(command)
    }

    /// Records a notification from a device.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank notification name, the device
    /// resolution error, or the store's error.
    pub async fn publish_notification(
        &self,
        principal: &Principal,
        device_id: &str,
        draft: NotificationDraft,
    ) -> Result<DeviceNotification> {
        if draft.notification.trim().is_empty() {
            return Err(ValidationError::MissingField("notification").into());
        }
        let device = self.publish_target(principal, device_id).await?;
        let notification = draft.into_notification(&device, Utc::now());

        let (notification, fan_out) = self.publisher.insert_notification(notification).await?;
        self.settle(EventKind::Notification, fan_out).await;
        Ok(notification)
    }

    /// Records a device's update of one of its commands.
    ///
    /// # Errors
    ///
    /// Returns the device resolution error or the store's error.
    pub async fn update_command(
        &self,
        principal: &Principal,
        device_id: &str,
        command_id: i64,
        update: CommandUpdate,
    ) -> Result<DeviceCommand> {
        self.publish_target(principal, device_id).await?;
        let (command, fan_out) = self
            .publisher
            .update_command(device_id, command_id, update)
            .await?;
        self.settle(EventKind::CommandUpdate, fan_out).await;
        Ok(command)
    }

    /// Announces consumed one-shot subscriptions and closes failed connections.
    async fn settle(&self, kind: EventKind, fan_out: FanOut) {
        let mut consumed = Vec::with_capacity(fan_out.consumed.len());
        for (connection, subscription) in fan_out.consumed {
            self.announce_unsubscribed(connection, subscription, kind);
            consumed.push(subscription);
        }
        self.release(consumed);

        for (connection, error) in fan_out.failed {
            self.transport_failed(connection, &error).await;
        }
    }
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Normalizes a legacy device list into its index key.
fn legacy_key(device_ids: Option<BTreeSet<String>>) -> Result<LegacyKey> {
    let key = device_ids.unwrap_or_default();
    if key.iter().any(|id| id.trim().is_empty()) {
        return Err(ValidationError::BlankDeviceId.into());
    }
    Ok(key)
}
