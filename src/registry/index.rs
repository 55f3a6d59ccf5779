// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concurrent filter index.
//!
//! Every filter is stored under a [`FilterKey`] in which unset fields are
//! replaced by the [`Slot::Any`] sentinel. Matching an event probes the keys
//! formed by taking, for each scoping field, either the event's value or the
//! sentinel: at most sixteen lookups, independent of how many subscriptions
//! exist.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::filter::Filter;
use crate::model::{EventKind, EventScope, SubscriptionId};

use super::Subscription;

/// One scoping field of an index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot<T> {
    /// Wildcard sentinel.
    Any,
    Is(T),
}

impl<T> From<Option<T>> for Slot<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Any, Self::Is)
    }
}

/// Index key of a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    kind: EventKind,
    network: Slot<i64>,
    device_type: Slot<i64>,
    device: Slot<String>,
    name: Slot<String>,
}

impl From<&Filter> for FilterKey {
    fn from(filter: &Filter) -> Self {
        Self {
            kind: filter.kind,
            network: filter.network_id.into(),
            device_type: filter.device_type_id.into(),
            device: filter.device_id.clone().into(),
            name: filter.name.clone().into(),
        }
    }
}

/// The event's value for a field, plus the wildcard.
fn candidates<T: Clone>(value: Option<&T>) -> Vec<Slot<T>> {
    match value {
        Some(v) => vec![Slot::Is(v.clone()), Slot::Any],
        None => vec![Slot::Any],
    }
}

/// Every key whose filter would match `scope`.
fn probe_keys(scope: &EventScope) -> Vec<FilterKey> {
    let mut keys = Vec::with_capacity(16);
    for network in candidates(scope.network_id.as_ref()) {
        for device_type in candidates(scope.device_type_id.as_ref()) {
            for device in candidates(Some(&scope.device_id)) {
                for name in candidates(Some(&scope.name)) {
                    keys.push(FilterKey {
                        kind: scope.kind,
                        network: network.clone(),
                        device_type: device_type.clone(),
                        device: device.clone(),
                        name,
                    });
                }
            }
        }
    }
    keys
}

/// Counters describing the registry's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Distinct filter keys with at least one subscription.
    pub filter_keys: usize,
}

/// The shared index of live subscriptions.
///
/// Reads and writes lock individual shards of the underlying maps only, so a
/// publish never waits on an unrelated subscribe or unsubscribe.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_id: DashMap<SubscriptionId, Arc<Subscription>>,
    by_filter: DashMap<FilterKey, HashSet<SubscriptionId>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a subscription under each of its filters.
    pub fn insert(&self, subscription: Arc<Subscription>) {
        let id = subscription.id();
        for filter in subscription.filters() {
            self.by_filter
                .entry(FilterKey::from(filter))
                .or_default()
                .insert(id);
        }
        tracing::trace!(
            subscription = %id,
            filters = subscription.filters().len(),
            "Indexed subscription"
        );
        self.by_id.insert(id, subscription);
    }

    /// Indexes every subscription.
    pub fn insert_all(&self, subscriptions: impl IntoIterator<Item = Arc<Subscription>>) {
        for subscription in subscriptions {
            self.insert(subscription);
        }
    }

    /// Removes a subscription from the index.
    ///
    /// Returns `None` if the id is not registered.
    pub fn remove_by_id(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let (_, subscription) = self.by_id.remove(&id)?;
        for filter in subscription.filters() {
            let key = FilterKey::from(filter);
            if let Some(mut ids) = self.by_filter.get_mut(&key) {
                ids.remove(&id);
            }
            self.by_filter.remove_if(&key, |_, ids| ids.is_empty());
        }
        tracing::trace!(subscription = %id, "Removed subscription from index");
        Some(subscription)
    }

    /// Removes every listed subscription, returning how many were registered.
    pub fn remove_all(&self, ids: impl IntoIterator<Item = SubscriptionId>) -> usize {
        ids.into_iter()
            .filter_map(|id| self.remove_by_id(id))
            .count()
    }

    /// Returns the subscription with `id`.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Returns every subscription that should receive an event with `scope`.
    ///
    /// A subscription with several matching filters is returned once.
    #[must_use]
    pub fn matching(&self, scope: &EventScope) -> Vec<Arc<Subscription>> {
        let mut ids = BTreeSet::new();
        for key in probe_keys(scope) {
            if let Some(bucket) = self.by_filter.get(&key) {
                ids.extend(bucket.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.get(id))
            .filter(|subscription| subscription.accepts(scope))
            .collect()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns registry counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            subscriptions: self.by_id.len(),
            filter_keys: self.by_filter.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::model::{ConnectionId, DeviceInfo};

    fn scope(kind: EventKind, device: &str, name: &str) -> EventScope {
        EventScope {
            kind,
            network_id: Some(5),
            device_type_id: Some(7),
            device_id: device.to_string(),
            name: name.to_string(),
            command_id: None,
        }
    }

    fn subscribe(registry: &SubscriptionRegistry, filters: Vec<Filter>) -> SubscriptionId {
        let kind = filters[0].kind;
        let sub = Arc::new(Subscription::new(
            kind,
            filters,
            Principal::admin(1),
            ConnectionId::next(),
        ));
        let id = sub.id();
        registry.insert(sub);
        id
    }

    fn matched_ids(registry: &SubscriptionRegistry, scope: &EventScope) -> Vec<SubscriptionId> {
        registry.matching(scope).iter().map(|s| s.id()).collect()
    }

    #[test]
    fn probe_keys_cover_every_wildcard_combination() {
        let keys = probe_keys(&scope(EventKind::Notification, "D1", "temp"));
        assert_eq!(keys.len(), 16);

        let mut orphan = scope(EventKind::Notification, "D1", "temp");
        orphan.network_id = None;
        orphan.device_type_id = None;
        assert_eq!(probe_keys(&orphan).len(), 4);
    }

    #[test]
    fn global_filter_matches_every_event_of_kind() {
        let registry = SubscriptionRegistry::new();
        let id = subscribe(&registry, vec![Filter::global(EventKind::Notification)]);

        assert_eq!(
            matched_ids(&registry, &scope(EventKind::Notification, "D1", "temp")),
            vec![id]
        );
        assert!(matched_ids(&registry, &scope(EventKind::Command, "D1", "temp")).is_empty());
    }

    #[test]
    fn named_device_filter_requires_exact_name() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceInfo::new("D1").with_network(5).with_device_type(7);
        let id = subscribe(
            &registry,
            vec![Filter::for_device(EventKind::Notification, &device).with_name("temp")],
        );

        assert!(matched_ids(&registry, &scope(EventKind::Notification, "D1", "humidity")).is_empty());
        assert!(matched_ids(&registry, &scope(EventKind::Notification, "D2", "temp")).is_empty());
        assert_eq!(
            matched_ids(&registry, &scope(EventKind::Notification, "D1", "temp")),
            vec![id]
        );
    }

    #[test]
    fn overlapping_filters_of_one_subscription_match_once() {
        let registry = SubscriptionRegistry::new();
        let id = subscribe(
            &registry,
            vec![
                Filter::scoped(EventKind::Command, Some(5), None),
                Filter::scoped(EventKind::Command, Some(5), Some(7)),
            ],
        );
        assert_eq!(
            matched_ids(&registry, &scope(EventKind::Command, "D1", "reboot")),
            vec![id]
        );
    }

    #[test]
    fn remove_restores_previous_match_set() {
        let registry = SubscriptionRegistry::new();
        let event = scope(EventKind::Notification, "D1", "temp");
        let keep = subscribe(&registry, vec![Filter::global(EventKind::Notification)]);
        let before = matched_ids(&registry, &event);
        let stats_before = registry.stats();

        let id = subscribe(
            &registry,
            vec![Filter::scoped(EventKind::Notification, Some(5), None).with_name("temp")],
        );
        assert_eq!(registry.len(), 2);
        assert!(registry.remove_by_id(id).is_some());

        assert_eq!(matched_ids(&registry, &event), before);
        assert_eq!(registry.stats(), stats_before);
        assert!(registry.contains(keep));
    }

    #[test]
    fn removing_unknown_id_is_noop() {
        let registry = SubscriptionRegistry::new();
        let id = subscribe(&registry, vec![Filter::global(EventKind::Command)]);
        assert!(registry.remove_by_id(id).is_some());
        assert!(registry.remove_by_id(id).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().filter_keys, 0);
    }

    #[test]
    fn remove_all_counts_registered_ids() {
        let registry = SubscriptionRegistry::new();
        let a = subscribe(&registry, vec![Filter::global(EventKind::Command)]);
        let b = subscribe(&registry, vec![Filter::global(EventKind::Notification)]);
        assert_eq!(registry.remove_all([a, b, SubscriptionId::new()]), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn one_shot_not_matched_for_other_commands() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceInfo::new("D1").with_network(5).with_device_type(7);
        let sub = Arc::new(Subscription::one_shot(
            Filter::for_device(EventKind::CommandUpdate, &device),
            10,
            Principal::admin(1),
            ConnectionId::next(),
        ));
        registry.insert(Arc::clone(&sub));

        let mut other = scope(EventKind::CommandUpdate, "D1", "reboot");
        other.command_id = Some(11);
        assert!(registry.matching(&other).is_empty());

        other.command_id = Some(10);
        assert_eq!(registry.matching(&other).len(), 1);
    }
}
