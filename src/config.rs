// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for the hub and the RPC gateway.

use std::time::Duration;

/// Default number of historical events replayed per subscribe.
pub const DEFAULT_REPLAY_LIMIT: usize = 100;

/// Default upper bound on a caller-supplied replay limit.
pub const MAX_REPLAY_LIMIT: usize = 1000;

/// Configuration of a [`SubscriptionHub`](crate::SubscriptionHub).
///
/// # Examples
///
/// ```
/// use hivebus::HubConfig;
///
/// let config = HubConfig::new()
///     .with_replay_default_limit(50)
///     .with_lifecycle_capacity(64);
/// assert_eq!(config.replay_limit(None), 50);
/// assert_eq!(config.replay_limit(Some(5000)), 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Events replayed when the caller gives no limit.
    pub replay_default_limit: usize,
    /// Cap applied to caller-supplied limits.
    pub replay_max_limit: usize,
    /// Capacity of the lifecycle broadcast channel.
    pub lifecycle_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            replay_default_limit: DEFAULT_REPLAY_LIMIT,
            replay_max_limit: MAX_REPLAY_LIMIT,
            lifecycle_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default replay limit.
    #[must_use]
    pub fn with_replay_default_limit(mut self, limit: usize) -> Self {
        self.replay_default_limit = limit;
        self
    }

    /// Sets the maximum replay limit.
    #[must_use]
    pub fn with_replay_max_limit(mut self, limit: usize) -> Self {
        self.replay_max_limit = limit;
        self
    }

    /// Sets the lifecycle channel capacity.
    #[must_use]
    pub fn with_lifecycle_capacity(mut self, capacity: usize) -> Self {
        self.lifecycle_capacity = capacity;
        self
    }

    /// Resolves the replay page size for a request.
    #[must_use]
    pub fn replay_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.replay_default_limit)
            .min(self.replay_max_limit)
    }
}

/// Configuration of an [`RpcGateway`](crate::rpc::RpcGateway).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hivebus::RpcConfig;
///
/// let config = RpcConfig::new()
///     .with_ping_attempts(3)
///     .with_call_timeout(Duration::from_secs(2));
/// assert_eq!(config.ping_attempts, 3);
///
/// let unbounded = RpcConfig::new().without_call_timeout();
/// assert!(unbounded.call_timeout.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Pings sent before the backend is declared unreachable.
    pub ping_attempts: u32,
    /// How long each ping waits for its reply.
    pub ping_timeout: Duration,
    /// Deadline applied to backend calls (`None` waits forever).
    pub call_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_attempts: 10,
            ping_timeout: Duration::from_secs(3),
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RpcConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of ping attempts.
    #[must_use]
    pub fn with_ping_attempts(mut self, attempts: u32) -> Self {
        self.ping_attempts = attempts;
        self
    }

    /// Sets the per-ping timeout.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Sets the backend call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Removes the backend call deadline.
    #[must_use]
    pub fn without_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }
}
