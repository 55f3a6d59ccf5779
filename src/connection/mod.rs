// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live client connections.
//!
//! - [`ConnectionState`] - per-connection subscription sets, one lock per event kind
//! - [`DeliveryDispatcher`] - the FIFO outbound queue and its single flusher
//! - [`Transport`] - the write side supplied by the connection-handling layer
//! - [`ConnectionTable`] - lookup from [`ConnectionId`](crate::model::ConnectionId)
//!   to state, used to resolve a subscription's delivery handle

mod dispatcher;
mod state;
mod table;

pub use dispatcher::{ChannelTransport, DeliveryDispatcher, Transport};
pub use state::{ConnectionState, LegacyKey};
pub use table::ConnectionTable;
