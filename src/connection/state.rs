// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription bookkeeping of a single connection.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::model::{ConnectionId, EventKind, SubscriptionId};
use crate::registry::{Subscription, SubscriptionRegistry};

use super::DeliveryDispatcher;

/// Key of the legacy device-list index.
///
/// "All devices" is keyed by the empty set.
pub type LegacyKey = BTreeSet<String>;

/// Subscriptions of one kind, guarded by that kind's lock.
#[derive(Debug, Default)]
struct KindSlot {
    ids: HashSet<SubscriptionId>,
    legacy: HashMap<LegacyKey, HashSet<SubscriptionId>>,
}

impl KindSlot {
    fn forget_legacy(&mut self, id: SubscriptionId) {
        self.legacy.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }
}

/// State of one live connection.
///
/// Each event kind has its own lock, so a slow subscribe on one stream never
/// blocks work on another. Registry updates for a kind happen while that
/// kind's lock is held, keeping the connection's id sets and the registry
/// consistent with each other. Nothing is awaited under these locks.
pub struct ConnectionState {
    id: ConnectionId,
    principal: Principal,
    opened_at: DateTime<Utc>,
    commands: Mutex<KindSlot>,
    command_updates: Mutex<KindSlot>,
    notifications: Mutex<KindSlot>,
    closed: AtomicBool,
    dispatcher: DeliveryDispatcher,
}

impl ConnectionState {
    /// Creates the state of a newly opened connection.
    #[must_use]
    pub fn new(id: ConnectionId, principal: Principal, dispatcher: DeliveryDispatcher) -> Self {
        Self {
            id,
            principal,
            opened_at: Utc::now(),
            commands: Mutex::default(),
            command_updates: Mutex::default(),
            notifications: Mutex::default(),
            closed: AtomicBool::new(false),
            dispatcher,
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the authenticated principal.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns when the connection was opened.
    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Returns the outbound dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &DeliveryDispatcher {
        &self.dispatcher
    }

    /// Returns `true` once [`on_close`](Self::on_close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn slot(&self, kind: EventKind) -> &Mutex<KindSlot> {
        match kind {
            EventKind::Command => &self.commands,
            EventKind::CommandUpdate => &self.command_updates,
            EventKind::Notification => &self.notifications,
        }
    }

    /// Registers a subscription owned by this connection.
    ///
    /// The id is recorded under every kind the subscription receives. When
    /// `legacy` is given the subscription is also recorded under that device
    /// set for [`unsubscribe_legacy`](Self::unsubscribe_legacy).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection is closed.
    pub fn subscribe(
        &self,
        registry: &SubscriptionRegistry,
        subscription: Arc<Subscription>,
        legacy: Option<LegacyKey>,
    ) -> Result<SubscriptionId> {
        let id = subscription.id();
        let kind = subscription.kind();
        let kinds = subscription.kinds();
        // Locks are always taken in `EventKind::ALL` order.
        let mut slots: Vec<_> = kinds.iter().map(|k| self.slot(*k).lock()).collect();
        if self.is_closed() {
            return Err(Error::ConnectionNotFound(self.id));
        }

        registry.insert(subscription);
        for (slot_kind, slot) in kinds.iter().zip(slots.iter_mut()) {
            slot.ids.insert(id);
            if *slot_kind == kind
                && let Some(key) = legacy.clone()
            {
                slot.legacy.entry(key).or_default().insert(id);
            }
        }
        drop(slots);

        tracing::debug!(
            connection = %self.id,
            subscription = %id,
            kind = %kind,
            kinds = kinds.len(),
            "Subscribed"
        );
        Ok(id)
    }

    /// Removes one subscription.
    ///
    /// `kind` may be any of the kinds the subscription receives. Returns
    /// `false` if this connection does not own `id` under `kind` (for
    /// instance because it was already removed).
    pub fn unsubscribe(
        &self,
        registry: &SubscriptionRegistry,
        kind: EventKind,
        id: SubscriptionId,
    ) -> bool {
        let kinds = registry
            .get(id)
            .filter(|subscription| subscription.connection() == self.id)
            .map_or_else(|| vec![kind], |subscription| subscription.kinds());
        let Some(primary) = kinds.iter().position(|k| *k == kind) else {
            return false;
        };

        let mut slots: Vec<_> = kinds.iter().map(|k| self.slot(*k).lock()).collect();
        if !slots[primary].ids.contains(&id) {
            return false;
        }
        for slot in &mut slots {
            slot.ids.remove(&id);
            slot.forget_legacy(id);
        }
        registry.remove_by_id(id);
        drop(slots);

        tracing::debug!(connection = %self.id, subscription = %id, kind = %kind, "Unsubscribed");
        true
    }

    /// Removes every subscription of `kind`.
    ///
    /// Returns the removed ids.
    pub fn unsubscribe_all(
        &self,
        registry: &SubscriptionRegistry,
        kind: EventKind,
    ) -> Vec<SubscriptionId> {
        let removed: Vec<SubscriptionId> = self
            .subscription_ids(kind)
            .into_iter()
            .filter(|id| self.unsubscribe(registry, kind, *id))
            .collect();

        tracing::debug!(
            connection = %self.id,
            kind = %kind,
            removed = removed.len(),
            "Unsubscribed all"
        );
        removed
    }

    /// Removes every subscription recorded under a legacy device set.
    ///
    /// Returns the removed ids; empty if nothing was recorded under `key`.
    pub fn unsubscribe_legacy(
        &self,
        registry: &SubscriptionRegistry,
        kind: EventKind,
        key: &LegacyKey,
    ) -> Vec<SubscriptionId> {
        let mut slot = self.slot(kind).lock();
        let Some(ids) = slot.legacy.remove(key) else {
            return Vec::new();
        };
        let removed: Vec<SubscriptionId> = ids
            .into_iter()
            .filter(|id| slot.ids.remove(id))
            .collect();
        for id in &removed {
            registry.remove_by_id(*id);
        }
        drop(slot);

        tracing::debug!(
            connection = %self.id,
            kind = %kind,
            devices = key.len(),
            removed = removed.len(),
            "Unsubscribed legacy device set"
        );
        removed
    }

    /// Returns `true` if this connection owns subscription `id` of `kind`.
    #[must_use]
    pub fn owns(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.slot(kind).lock().ids.contains(&id)
    }

    /// Returns the ids of every subscription of `kind`.
    #[must_use]
    pub fn subscription_ids(&self, kind: EventKind) -> Vec<SubscriptionId> {
        self.slot(kind).lock().ids.iter().copied().collect()
    }

    /// Returns the number of distinct subscriptions across all kinds.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut ids = HashSet::new();
        for kind in EventKind::ALL {
            ids.extend(self.slot(kind).lock().ids.iter().copied());
        }
        ids.len()
    }

    /// Tears down every subscription and closes the dispatcher.
    ///
    /// Returns the removed ids so the caller can tell the backend. Running it
    /// again returns nothing.
    pub fn on_close(&self, registry: &SubscriptionRegistry) -> Vec<SubscriptionId> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.dispatcher.close();

        let mut seen = HashSet::new();
        let mut removed = Vec::new();
        for kind in EventKind::ALL {
            let mut slot = self.slot(kind).lock();
            let ids = std::mem::take(&mut slot.ids);
            slot.legacy.clear();
            for id in ids {
                if seen.insert(id) {
                    registry.remove_by_id(id);
                    removed.push(id);
                }
            }
        }

        tracing::debug!(
            connection = %self.id,
            removed = removed.len(),
            "Connection state closed"
        );
        removed
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
