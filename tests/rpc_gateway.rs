// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hub running on top of `RpcBackend`, with replies produced by an
//! in-process server over the in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{FakeBackend, drain, wait_for_release};
use hivebus::auth::Principal;
use hivebus::backend::{EntityQuery, EventStore};
use hivebus::connection::ChannelTransport;
use hivebus::error::{Error, RpcError};
use hivebus::filter::SubscribeParams;
use hivebus::model::{CommandDraft, CommandUpdate, EventKind, NotificationDraft};
use hivebus::rpc::{
    RequestBody, RequestKind, ResponseBody, RpcBackend, RpcGateway, RpcRequest, RpcResponse,
    RpcTransport,
};
use hivebus::{RpcConfig, SubscribeRequest, SubscriptionHub};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Serves every request against a [`FakeBackend`] on a spawned task.
struct Loopback {
    backend: Arc<FakeBackend>,
    replies: mpsc::UnboundedSender<RpcResponse>,
    seen: Mutex<Vec<RpcRequest>>,
    silent: bool,
}

#[async_trait]
impl RpcTransport for Loopback {
    async fn send(&self, request: &RpcRequest) -> Result<(), RpcError> {
        self.seen.lock().push(request.clone());
        if self.silent {
            return Ok(());
        }
        let backend = Arc::clone(&self.backend);
        let replies = self.replies.clone();
        let request = request.clone();
        tokio::spawn(async move {
            if let Some(response) = serve(&backend, &request).await {
                let _ = replies.send(response);
            }
        });
        Ok(())
    }

    fn reply_to(&self) -> Option<String> {
        Some("loopback/replies".to_string())
    }
}

async fn serve(backend: &FakeBackend, request: &RpcRequest) -> Option<RpcResponse> {
    let id = request.correlation_id;
    if request.kind == RequestKind::Ping {
        return Some(RpcResponse::reply(id, Value::Null));
    }
    let body: RequestBody = match serde_json::from_value(request.body.clone()) {
        Ok(body) => body,
        Err(e) => return Some(RpcResponse::failure(id, 400, e.to_string())),
    };

    let result = match body {
        RequestBody::FindDevices { ids, principal } => backend
            .find_devices(&ids, principal.as_ref())
            .await
            .map(ResponseBody::Devices),
        RequestBody::ListNetworks { criteria } => {
            backend.list_networks(&criteria).await.map(ResponseBody::Networks)
        }
        RequestBody::ListDeviceTypes { criteria } => backend
            .list_device_types(&criteria)
            .await
            .map(ResponseBody::DeviceTypes),
        RequestBody::InsertCommand { command } => {
            backend.insert_command(command).await.map(ResponseBody::Command)
        }
        RequestBody::InsertNotification { notification } => backend
            .insert_notification(notification)
            .await
            .map(ResponseBody::Notification),
        RequestBody::UpdateCommand {
            device_id,
            command_id,
            update,
        } => backend
            .update_command(&device_id, command_id, update)
            .await
            .map(ResponseBody::Command),
        RequestBody::FindCommand {
            device_id,
            command_id,
        } => backend
            .find_command(&device_id, command_id)
            .await
            .map(ResponseBody::MaybeCommand),
        RequestBody::FindHistory { query } => {
            backend.find_history(&query).await.map(ResponseBody::Events)
        }
        RequestBody::ReleaseSubscriptions { ids } => {
            let _ = backend.release_subscriptions(&ids).await;
            return None;
        }
    };

    Some(match result {
        Ok(body) => RpcResponse::reply(id, serde_json::to_value(body).unwrap()),
        Err(e) => RpcResponse::failure(id, e.status_code(), e.to_string()),
    })
}

struct Stack {
    hub: SubscriptionHub,
    gateway: Arc<RpcGateway>,
    transport: Arc<Loopback>,
    backend: Arc<FakeBackend>,
}

fn stack(config: RpcConfig, silent: bool) -> Stack {
    let backend = FakeBackend::shared();
    let (replies, responses) = mpsc::unbounded_channel();
    let transport = Arc::new(Loopback {
        backend: Arc::clone(&backend),
        replies,
        seen: Mutex::new(Vec::new()),
        silent,
    });
    let gateway = Arc::new(RpcGateway::new(Arc::clone(&transport) as _, config));
    gateway.spawn_listener(responses);

    let hub = SubscriptionHub::from_backend(Arc::new(RpcBackend::new(Arc::clone(&gateway))));
    Stack {
        hub,
        gateway,
        transport,
        backend,
    }
}

// =============================================================================
// Gateway
// =============================================================================

mod gateway {
    use super::*;

    #[tokio::test]
    async fn ping_is_answered() {
        let stack = stack(RpcConfig::default(), false);
        stack.gateway.ping().await.unwrap();
        assert_eq!(stack.gateway.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_is_unreachable() {
        let config = RpcConfig::new()
            .with_ping_attempts(2)
            .with_ping_timeout(Duration::from_millis(100));
        let stack = stack(config, true);

        let err = stack.gateway.ping().await.unwrap_err();
        assert!(matches!(err, RpcError::ServerUnreachable { attempts: 2 }));
        assert_eq!(stack.transport.seen.lock().len(), 2);
        assert_eq!(stack.gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn requests_carry_reply_address() {
        let stack = stack(RpcConfig::default(), false);
        stack
            .gateway
            .request(RpcRequest::new(
                serde_json::to_value(RequestBody::ListNetworks {
                    criteria: hivebus::ListCriteria::default(),
                })
                .unwrap(),
            ))
            .await
            .unwrap();

        let seen = stack.transport.seen.lock();
        assert_eq!(seen[0].reply_to.as_deref(), Some("loopback/replies"));
    }
}

// =============================================================================
// Hub over RPC
// =============================================================================

mod hub {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_publish_round_trip() {
        let stack = stack(RpcConfig::default(), false);
        let admin = Principal::admin(1);
        let (transport, mut rx) = ChannelTransport::pair();
        let conn = stack.hub.open_connection(admin.clone(), transport);

        let request = SubscribeRequest::new(EventKind::Notification)
            .with_params(SubscribeParams::new().device("D1").names(["temp"]));
        stack.hub.subscribe(conn, &request).await.unwrap();

        let stored = stack
            .hub
            .publish_notification(&admin, "D1", NotificationDraft::new("temp"))
            .await
            .unwrap();
        assert!(stored.id > 0);
        assert_eq!(stack.backend.notification_count(), 1);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["notification"]["id"], stored.id);

        let seen = stack.transport.seen.lock();
        let insert = seen
            .iter()
            .find(|r| r.body["action"] == "insert_notification")
            .unwrap();
        assert_eq!(insert.partition_key.as_deref(), Some("D1"));
    }

    #[tokio::test]
    async fn remote_failures_surface_with_their_status() {
        let stack = stack(RpcConfig::default(), false);
        let admin = Principal::admin(1);

        let err = stack
            .hub
            .update_command(&admin, "D1", 4242, CommandUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcError::Remote { code: 404, .. })));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn authorization_is_resolved_through_the_backend() {
        let stack = stack(RpcConfig::default(), false);
        stack.backend.grant(3, [6]);
        let (transport, _rx) = ChannelTransport::pair();
        let conn = stack.hub.open_connection(Principal::client(3), transport);

        let request = SubscribeRequest::new(EventKind::Command)
            .with_params(SubscribeParams::new().device("D1"));
        assert!(matches!(
            stack.hub.subscribe(conn, &request).await,
            Err(Error::Forbidden(_))
        ));

        let request = SubscribeRequest::new(EventKind::Command)
            .with_params(SubscribeParams::new().device("D2"));
        assert!(stack.hub.subscribe(conn, &request).await.is_ok());
    }

    #[tokio::test]
    async fn command_update_one_shot_over_rpc() {
        let stack = stack(RpcConfig::default(), false);
        let admin = Principal::admin(1);
        let (transport, mut rx) = ChannelTransport::pair();
        let conn = stack.hub.open_connection(admin.clone(), transport);

        let command = stack
            .hub
            .publish_command(&admin, "D3", CommandDraft::new("open"))
            .await
            .unwrap();
        let sub = stack
            .hub
            .subscribe_command_update(conn, "D3", command.id)
            .await
            .unwrap();

        stack
            .hub
            .update_command(
                &admin,
                "D3",
                command.id,
                CommandUpdate {
                    status: Some("opened".into()),
                    result: None,
                },
            )
            .await
            .unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["command"]["status"], "opened");
        assert_eq!(wait_for_release(&stack.backend, 1).await, vec![sub]);
    }

    #[tokio::test]
    async fn close_releases_subscriptions_without_waiting_for_a_reply() {
        let stack = stack(RpcConfig::default(), false);
        let (transport, _rx) = ChannelTransport::pair();
        let conn = stack.hub.open_connection(Principal::admin(1), transport);

        let sub = stack
            .hub
            .subscribe(conn, &SubscribeRequest::new(EventKind::Notification))
            .await
            .unwrap();
        stack.hub.close_connection(conn).await;

        assert_eq!(wait_for_release(&stack.backend, 1).await, vec![sub]);
        assert_eq!(stack.gateway.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_timeout_fails_the_subscribe_cleanly() {
        let config = RpcConfig::new().with_call_timeout(Duration::from_millis(50));
        let stack = stack(config, true);
        let (transport, _rx) = ChannelTransport::pair();
        let conn = stack.hub.open_connection(Principal::admin(1), transport);

        let request = SubscribeRequest::new(EventKind::Notification)
            .with_params(SubscribeParams::new().device("D1"));
        let err = stack.hub.subscribe(conn, &request).await.unwrap_err();

        assert!(matches!(err, Error::Rpc(RpcError::Timeout(50))));
        assert_eq!(err.status_code(), 504);
        assert_eq!(stack.hub.stats().subscriptions, 0);
        assert_eq!(stack.gateway.pending_count(), 0);
    }
}
