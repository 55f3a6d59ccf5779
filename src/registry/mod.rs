// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live subscriptions and the shared index used to fan events out to them.
//!
//! - [`Subscription`] - one registration: a filter set, its owner and delivery handle
//! - [`SubscriptionRegistry`] - concurrent filter index queried on every publish

mod index;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::auth::Principal;
use crate::filter::Filter;
use crate::model::{ConnectionId, EventKind, EventScope, SubscriptionId};

pub use index::{RegistryStats, SubscriptionRegistry};

/// A live registration of interest in one event stream.
///
/// A subscription owns every filter produced for a single subscribe request
/// and is addressed by one externally visible id. Delivery goes to the owning
/// connection, identified by its [`ConnectionId`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    filters: Vec<Filter>,
    principal: Principal,
    connection: ConnectionId,
    created_at: DateTime<Utc>,
    /// Set for one-shot command-update subscriptions.
    command_id: Option<i64>,
    claimed: AtomicBool,
}

impl Subscription {
    /// Creates a subscription over `filters`.
    ///
    /// Every filter must belong to `kind`, except that a command
    /// subscription may also carry command-update filters.
    #[must_use]
    pub fn new(
        kind: EventKind,
        filters: Vec<Filter>,
        principal: Principal,
        connection: ConnectionId,
    ) -> Self {
        debug_assert!(filters.iter().all(|f| f.kind == kind
            || (kind == EventKind::Command && f.kind == EventKind::CommandUpdate)));
        Self {
            id: SubscriptionId::new(),
            kind,
            filters,
            principal,
            connection,
            created_at: Utc::now(),
            command_id: None,
            claimed: AtomicBool::new(false),
        }
    }

    /// Creates a subscription that receives the next update of one command
    /// and is then removed.
    #[must_use]
    pub fn one_shot(
        filter: Filter,
        command_id: i64,
        principal: Principal,
        connection: ConnectionId,
    ) -> Self {
        Self {
            command_id: Some(command_id),
            ..Self::new(EventKind::CommandUpdate, vec![filter], principal, connection)
        }
    }

    /// Returns the subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the subscribed stream.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns every stream this subscription receives, in
    /// [`EventKind::ALL`] order.
    ///
    /// This is more than [`kind`](Self::kind) only for command subscriptions
    /// that also follow updates of the matched commands.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|k| *k == self.kind || self.filters.iter().any(|f| f.kind == *k))
            .collect()
    }

    /// Returns the filters this subscription is indexed under.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns the principal captured at subscribe time.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns the owning connection.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns when the subscription was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the command id a one-shot subscription waits for.
    #[must_use]
    pub fn command_id(&self) -> Option<i64> {
        self.command_id
    }

    /// Returns `true` for one-shot subscriptions.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.command_id.is_some()
    }

    /// Returns `true` if an event with `scope` should be delivered here.
    ///
    /// Filter matching is done by the index; this only applies the one-shot
    /// restrictions.
    #[must_use]
    pub fn accepts(&self, scope: &EventScope) -> bool {
        match self.command_id {
            Some(id) => scope.command_id == Some(id) && !self.claimed.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Claims the right to deliver.
    ///
    /// Always succeeds for regular subscriptions. A one-shot subscription is
    /// claimed exactly once, so concurrent publishers deliver at most one update.
    pub fn claim(&self) -> bool {
        if self.command_id.is_none() {
            return true;
        }
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
