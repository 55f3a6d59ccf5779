// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `hivebus` - subscription and fan-out engine for device event streams.
//!
//! Clients hold long-lived connections and subscribe to three streams of
//! device events: commands, command updates and notifications. Publishing an
//! event persists it through the backend and delivers it to every connection
//! whose subscription filters match, in per-connection FIFO order.
//!
//! # Components
//!
//! - [`filter`]: turns subscribe parameters into authorized [`Filter`] sets
//! - [`registry`]: the concurrent filter index consulted on every publish
//! - [`connection`]: per-connection subscription sets and outbound queues
//! - [`replay`]: catch-up delivery of stored events at subscribe time
//! - [`publisher`]: persistence followed by fan-out
//! - [`rpc`]: correlated request/reply channel to the backend services
//! - [`SubscriptionHub`]: the facade tying it all together
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hivebus::{SubscribeRequest, SubscriptionHub};
//! use hivebus::auth::Principal;
//! use hivebus::connection::ChannelTransport;
//! use hivebus::filter::SubscribeParams;
//! use hivebus::model::{EventKind, NotificationDraft};
//!
//! # async fn example(backend: Arc<MyBackend>) -> hivebus::Result<()> {
//! let hub = SubscriptionHub::from_backend(backend);
//!
//! let admin = Principal::admin(1);
//! let (transport, mut outbound) = ChannelTransport::pair();
//! let conn = hub.open_connection(admin.clone(), transport);
//!
//! let request = SubscribeRequest::new(EventKind::Notification)
//!     .with_params(SubscribeParams::new().device("D1").names(["temp"]));
//! let subscription = hub.subscribe(conn, &request).await?;
//!
//! hub.publish_notification(&admin, "D1", NotificationDraft::new("temp")).await?;
//! let message = outbound.recv().await; // {"action":"notification/insert",...}
//!
//! hub.close_connection(conn).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Backend
//!
//! Entity lookups and event storage are behind the [`EntityQuery`] and
//! [`EventStore`] traits. [`rpc::RpcBackend`] implements both over an
//! [`rpc::RpcGateway`], which can run over MQTT with the `mqtt` feature
//! (enabled by default).

pub mod auth;
pub mod backend;
mod config;
pub mod connection;
pub mod error;
pub mod filter;
mod hub;
pub mod lifecycle;
pub mod model;
pub mod publisher;
pub mod registry;
pub mod replay;
pub mod rpc;
pub mod wire;

pub use auth::{Access, Principal, Role};
pub use backend::{EntityQuery, EventStore, HistoryQuery, ListCriteria};
pub use config::{DEFAULT_REPLAY_LIMIT, HubConfig, MAX_REPLAY_LIMIT, RpcConfig};
pub use error::{Error, Result, RpcError, TransportError, ValidationError};
pub use filter::{Filter, FilterBuilder, SubscribeParams};
pub use hub::{HubStats, SubscribeRequest, SubscriptionHub};
pub use lifecycle::{HubEvent, LifecycleBus};
pub use model::{ConnectionId, Event, EventKind, SubscriptionId};
pub use wire::ServerMessage;
