// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model shared by every component: identifiers, entity views and events.

mod device;
mod event;
mod ids;

pub use device::{DeviceInfo, DeviceTypeInfo, NetworkInfo};
pub use event::{
    CommandDraft, CommandUpdate, DeviceCommand, DeviceNotification, Event, EventKind, EventScope,
    NotificationDraft,
};
pub use ids::{ConnectionId, CorrelationId, SubscriptionId};
