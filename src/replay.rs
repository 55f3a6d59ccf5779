// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delivery of stored events newer than a client-supplied timestamp.
//!
//! Replay runs after the subscription is registered, so nothing published
//! after registration is missed. An event persisted between registration and
//! the history query can therefore arrive twice, once live and once replayed;
//! consumers should deduplicate by event id.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backend::{EventStore, HistoryQuery};
use crate::connection::ConnectionState;
use crate::error::Result;
use crate::model::Event;
use crate::registry::Subscription;
use crate::wire::ServerMessage;

/// Queries history and enqueues it for a new subscription.
#[derive(Clone)]
pub struct ReplayCoordinator {
    store: Arc<dyn EventStore>,
}

impl ReplayCoordinator {
    /// Creates a coordinator reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Fetches up to `limit` stored events for `subscription` with a
    /// timestamp strictly after `since`, oldest first.
    ///
    /// A subscription receiving several kinds is queried once per kind and
    /// the results merged.
    ///
    /// # Errors
    ///
    /// Returns the store's error if a query fails.
    pub async fn history(
        &self,
        subscription: &Subscription,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for kind in subscription.kinds() {
            let query = HistoryQuery {
                kind,
                filters: subscription
                    .filters()
                    .iter()
                    .filter(|f| f.kind == kind)
                    .cloned()
                    .collect(),
                since,
                limit,
            };
            events.extend(self.store.find_history(&query).await?);
        }
        Ok(select(events, subscription, since, limit))
    }

    /// Enqueues the history of `subscription` on `connection`.
    ///
    /// Returns the number of events enqueued. The caller flushes.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the query fails, or a JSON error.
    pub async fn replay(
        &self,
        connection: &ConnectionState,
        subscription: &Subscription,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        let events = self.history(subscription, since, limit).await?;
        let mut enqueued = 0;
        for event in &events {
            let message = ServerMessage::for_event(subscription.id(), event).to_json()?;
            if !connection.dispatcher().enqueue_for(subscription.id(), message) {
                break;
            }
            enqueued += 1;
        }
        tracing::debug!(
            connection = %connection.id(),
            subscription = %subscription.id(),
            since = %since,
            enqueued,
            "Replayed history"
        );
        Ok(enqueued)
    }
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator").finish_non_exhaustive()
    }
}

/// Keeps in-scope events after `since`, oldest first, without duplicates.
fn select(
    mut events: Vec<Event>,
    subscription: &Subscription,
    since: DateTime<Utc>,
    limit: usize,
) -> Vec<Event> {
    events.retain(|event| {
        let scope = event.scope();
        event.timestamp() > since
            && subscription.filters().iter().any(|f| f.matches(&scope))
            && subscription.accepts(&scope)
    });
    events.sort_by_key(|event| (event.timestamp(), event.id()));

    let mut seen = HashSet::new();
    events.retain(|event| seen.insert((event.kind(), event.id())));
    events.truncate(limit);
    events
}
