// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity queries and event storage served by the backend over RPC.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::backend::{EntityQuery, EventStore, HistoryQuery, ListCriteria};
use crate::error::{Error, Result, RpcError};
use crate::model::{
    CommandUpdate, DeviceCommand, DeviceInfo, DeviceNotification, DeviceTypeInfo, Event,
    NetworkInfo, SubscriptionId,
};

use super::{RpcGateway, RpcRequest};

/// Request payloads understood by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RequestBody {
    /// Look up devices, optionally restricted to a principal.
    FindDevices {
        /// Device ids.
        ids: Vec<String>,
        /// Restrict to devices this principal may access.
        principal: Option<Principal>,
    },
    /// List networks.
    ListNetworks {
        /// Listing criteria.
        criteria: ListCriteria,
    },
    /// List device types.
    ListDeviceTypes {
        /// Listing criteria.
        criteria: ListCriteria,
    },
    /// Persist a command.
    InsertCommand {
        /// The command.
        command: DeviceCommand,
    },
    /// Persist a notification.
    InsertNotification {
        /// The notification.
        notification: DeviceNotification,
    },
    /// Update a stored command.
    UpdateCommand {
        /// Device the command belongs to.
        device_id: String,
        /// Command id.
        command_id: i64,
        /// Fields to change.
        update: CommandUpdate,
    },
    /// Look up a stored command.
    FindCommand {
        /// Device the command belongs to.
        device_id: String,
        /// Command id.
        command_id: i64,
    },
    /// Search stored events.
    FindHistory {
        /// The search.
        query: HistoryQuery,
    },
    /// Release server-side resources of removed subscriptions.
    ReleaseSubscriptions {
        /// Removed subscription ids.
        ids: Vec<SubscriptionId>,
    },
}

/// Reply payloads sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Device lookup result.
    Devices(Vec<DeviceInfo>),
    /// Network listing.
    Networks(Vec<NetworkInfo>),
    /// Device type listing.
    DeviceTypes(Vec<DeviceTypeInfo>),
    /// A stored command.
    Command(DeviceCommand),
    /// Result of a command lookup.
    MaybeCommand(Option<DeviceCommand>),
    /// A stored notification.
    Notification(DeviceNotification),
    /// Stored events.
    Events(Vec<Event>),
    /// Plain acknowledgement.
    Ack,
}

impl ResponseBody {
    fn variant(&self) -> &'static str {
        match self {
            Self::Devices(_) => "devices",
            Self::Networks(_) => "networks",
            Self::DeviceTypes(_) => "device_types",
            Self::Command(_) => "command",
            Self::MaybeCommand(_) => "maybe_command",
            Self::Notification(_) => "notification",
            Self::Events(_) => "events",
            Self::Ack => "ack",
        }
    }
}

/// Implements [`EntityQuery`] and [`EventStore`] by calling the backend.
///
/// Requests about one device share a partition key so the backend sees them
/// in order.
#[derive(Debug, Clone)]
pub struct RpcBackend {
    gateway: Arc<RpcGateway>,
}

impl RpcBackend {
    /// Creates a backend client over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<RpcGateway>) -> Self {
        Self { gateway }
    }

    /// Returns the underlying gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<RpcGateway> {
        &self.gateway
    }

    async fn send(&self, body: RequestBody, partition: Option<&str>) -> Result<ResponseBody> {
        let mut request = RpcRequest::new(serde_json::to_value(&body)?);
        if let Some(key) = partition {
            request = request.with_partition_key(key);
        }
        let reply = self.gateway.request(request).await?;
        Ok(serde_json::from_value(reply)?)
    }
}

fn unexpected(expected: &str, got: &ResponseBody) -> Error {
    Error::Rpc(RpcError::UnexpectedReply(format!(
        "expected {expected}, got {}",
        got.variant()
    )))
}

#[async_trait]
impl EntityQuery for RpcBackend {
    async fn find_devices(
        &self,
        ids: &[String],
        principal: Option<&Principal>,
    ) -> Result<Vec<DeviceInfo>> {
        let body = RequestBody::FindDevices {
            ids: ids.to_vec(),
            principal: principal.cloned(),
        };
        match self.send(body, None).await? {
            ResponseBody::Devices(devices) => Ok(devices),
            other => Err(unexpected("devices", &other)),
        }
    }

    async fn list_networks(&self, criteria: &ListCriteria) -> Result<Vec<NetworkInfo>> {
        let body = RequestBody::ListNetworks {
            criteria: criteria.clone(),
        };
        match self.send(body, None).await? {
            ResponseBody::Networks(networks) => Ok(networks),
            other => Err(unexpected("networks", &other)),
        }
    }

    async fn list_device_types(&self, criteria: &ListCriteria) -> Result<Vec<DeviceTypeInfo>> {
        let body = RequestBody::ListDeviceTypes {
            criteria: criteria.clone(),
        };
        match self.send(body, None).await? {
            ResponseBody::DeviceTypes(types) => Ok(types),
            other => Err(unexpected("device_types", &other)),
        }
    }
}

#[async_trait]
impl EventStore for RpcBackend {
    async fn insert_command(&self, command: DeviceCommand) -> Result<DeviceCommand> {
        let partition = command.device_id.clone();
        match self
            .send(RequestBody::InsertCommand { command }, Some(&partition))
            .await?
        {
            ResponseBody::Command(command) => Ok(command),
            other => Err(unexpected("command", &other)),
        }
    }

    async fn insert_notification(
        &self,
        notification: DeviceNotification,
    ) -> Result<DeviceNotification> {
        let partition = notification.device_id.clone();
        match self
            .send(
                RequestBody::InsertNotification { notification },
                Some(&partition),
            )
            .await?
        {
            ResponseBody::Notification(notification) => Ok(notification),
            other => Err(unexpected("notification", &other)),
        }
    }

    async fn update_command(
        &self,
        device_id: &str,
        command_id: i64,
        update: CommandUpdate,
    ) -> Result<DeviceCommand> {
        let body = RequestBody::UpdateCommand {
            device_id: device_id.to_string(),
            command_id,
            update,
        };
        match self.send(body, Some(device_id)).await? {
            ResponseBody::Command(command) => Ok(command),
            other => Err(unexpected("command", &other)),
        }
    }

    async fn find_command(&self, device_id: &str, command_id: i64) -> Result<Option<DeviceCommand>> {
        let body = RequestBody::FindCommand {
            device_id: device_id.to_string(),
            command_id,
        };
        match self.send(body, Some(device_id)).await? {
            ResponseBody::MaybeCommand(command) => Ok(command),
            other => Err(unexpected("maybe_command", &other)),
        }
    }

    async fn find_history(&self, query: &HistoryQuery) -> Result<Vec<Event>> {
        let body = RequestBody::FindHistory {
            query: query.clone(),
        };
        match self.send(body, None).await? {
            ResponseBody::Events(events) => Ok(events),
            other => Err(unexpected("events", &other)),
        }
    }

    async fn release_subscriptions(&self, ids: &[SubscriptionId]) -> Result<()> {
        let body = RequestBody::ReleaseSubscriptions { ids: ids.to_vec() };
        let request = RpcRequest::new(serde_json::to_value(&body)?);
        self.gateway.push(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::rpc::{RpcResponse, RpcTransport};
    use serde_json::json;

    /// Answers every request immediately with a fixed body.
    struct Scripted {
        gateway: parking_lot::Mutex<Option<std::sync::Weak<RpcGateway>>>,
        reply: serde_json::Value,
        sent: parking_lot::Mutex<Vec<RpcRequest>>,
    }

    #[async_trait]
    impl RpcTransport for Scripted {
        async fn send(&self, request: &RpcRequest) -> std::result::Result<(), RpcError> {
            self.sent.lock().push(request.clone());
            let gateway = self.gateway.lock().as_ref().and_then(std::sync::Weak::upgrade);
            if let Some(gateway) = gateway {
                if request.single_reply {
                    gateway.resolve(RpcResponse::reply(request.correlation_id, self.reply.clone()));
                }
            }
            Ok(())
        }
    }

    fn backend(reply: serde_json::Value) -> (RpcBackend, Arc<Scripted>) {
        let transport = Arc::new(Scripted {
            gateway: parking_lot::Mutex::new(None),
            reply,
            sent: parking_lot::Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(RpcGateway::new(
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
            RpcConfig::default(),
        ));
        *transport.gateway.lock() = Some(Arc::downgrade(&gateway));
        (RpcBackend::new(gateway), transport)
    }

    #[test]
    fn request_body_is_tagged_by_action() {
        let body = RequestBody::FindCommand {
            device_id: "D1".into(),
            command_id: 9,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["action"], "find_command");
        assert_eq!(value["deviceId"], "D1");
        assert_eq!(value["commandId"], 9);
    }

    #[tokio::test]
    async fn list_networks_decodes_reply() {
        let reply = json!({"type": "networks", "data": [{"id": 5, "name": "home"}]});
        let (backend, transport) = backend(reply);

        let networks = backend.list_networks(&ListCriteria::ids([5])).await.unwrap();
        assert_eq!(networks, vec![NetworkInfo { id: 5, name: "home".into() }]);

        let sent = transport.sent.lock()[0].clone();
        assert_eq!(sent.body["action"], "list_networks");
    }

    #[tokio::test]
    async fn mismatched_reply_is_reported() {
        let (backend, _) = backend(json!({"type": "ack"}));
        let err = backend.find_devices(&["D1".into()], None).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcError::UnexpectedReply(_))));
    }

    #[tokio::test]
    async fn device_requests_carry_partition_key() {
        let (backend, transport) = backend(json!({"type": "maybe_command", "data": null}));
        let found = backend.find_command("D7", 3).await.unwrap();
        assert!(found.is_none());
        assert_eq!(transport.sent.lock()[0].partition_key.as_deref(), Some("D7"));
    }

    #[tokio::test]
    async fn release_is_fire_and_forget() {
        let (backend, transport) = backend(json!(null));
        backend
            .release_subscriptions(&[SubscriptionId::new()])
            .await
            .unwrap();
        assert_eq!(backend.gateway().pending_count(), 0);
        assert_eq!(transport.sent.lock()[0].body["action"], "release_subscriptions");
    }
}
