// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC transport over an MQTT broker.
//!
//! Requests are published as JSON on a shared request topic. Each transport
//! subscribes to its own reply topic, stamped on every request as `replyTo`,
//! and forwards decoded replies to the gateway's listener.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use hivebus::RpcConfig;
//! use hivebus::rpc::{MqttRpcTransport, RpcGateway};
//!
//! # async fn example() -> Result<(), hivebus::error::RpcError> {
//! let (transport, replies) = MqttRpcTransport::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("hub", "secret")
//!     .build()
//!     .await?;
//!
//! let gateway = Arc::new(RpcGateway::new(Arc::new(transport), RpcConfig::default()));
//! gateway.spawn_listener(replies);
//! gateway.ping().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::{mpsc, oneshot};

use crate::error::RpcError;

use super::{RpcRequest, RpcResponse, RpcTransport};

/// Global counter for generating unique client IDs.
static TRANSPORT_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default topic requests are published on.
pub const DEFAULT_REQUEST_TOPIC: &str = "hivebus/request";

/// Configuration for an MQTT RPC transport.
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
    request_topic: String,
    reply_topic: Option<String>,
}

impl MqttTransportConfig {
    /// The topic replies for `client_id` are expected on.
    fn reply_topic_for(&self, client_id: &str) -> String {
        self.reply_topic
            .clone()
            .unwrap_or_else(|| format!("hivebus/reply/{client_id}"))
    }
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            request_topic: DEFAULT_REQUEST_TOPIC.to_string(),
            reply_topic: None,
        }
    }
}

/// An [`RpcTransport`] publishing requests to an MQTT broker.
///
/// Cheaply cloneable; clones share one broker connection.
#[derive(Clone)]
pub struct MqttRpcTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    client: AsyncClient,
    config: MqttTransportConfig,
    reply_topic: String,
    connected: AtomicBool,
}

impl MqttRpcTransport {
    /// Creates a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> MqttRpcTransportBuilder {
        MqttRpcTransportBuilder::default()
    }

    /// Returns whether the broker connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Returns the topic requests are published on.
    #[must_use]
    pub fn request_topic(&self) -> &str {
        &self.inner.config.request_topic
    }

    /// Returns the topic replies are expected on.
    #[must_use]
    pub fn reply_topic(&self) -> &str {
        &self.inner.reply_topic
    }

    /// Disconnects from the broker.
    ///
    /// The reply channel closes once the event loop stops, which makes the
    /// gateway's listener abandon any pending requests.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting RPC transport from MQTT broker"
        );
        self.inner.client.disconnect().await?;
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for MqttRpcTransport {
    async fn send(&self, request: &RpcRequest) -> Result<(), RpcError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| RpcError::SendFailed(e.to_string()))?;
        self.inner
            .client
            .publish(
                self.inner.config.request_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await?;
        tracing::trace!(
            topic = %self.inner.config.request_topic,
            correlation = %request.correlation_id,
            "Published RPC request"
        );
        Ok(())
    }

    fn reply_to(&self) -> Option<String> {
        Some(self.inner.reply_topic.clone())
    }
}

impl std::fmt::Debug for MqttRpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttRpcTransport")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("reply_topic", &self.inner.reply_topic)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Builder for an [`MqttRpcTransport`].
#[derive(Debug, Default)]
pub struct MqttRpcTransportBuilder {
    config: MqttTransportConfig,
}

impl MqttRpcTransportBuilder {
    /// Broker to connect to. Required.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Broker port; 1883 unless set.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Username and password presented on connect.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// MQTT keep-alive; 30 seconds unless set.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// How long [`build`](Self::build) waits for the broker's ConnAck.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Topic the backend consumes requests from; [`DEFAULT_REQUEST_TOPIC`]
    /// unless set.
    #[must_use]
    pub fn request_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.request_topic = topic.into();
        self
    }

    /// Fixed reply topic. Without one, each transport listens on
    /// `hivebus/reply/<client id>`.
    #[must_use]
    pub fn reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.reply_topic = Some(topic.into());
        self
    }

    /// Connects to the broker and subscribes to the reply topic.
    ///
    /// Returns the transport and the channel decoded replies arrive on; hand
    /// the latter to [`RpcGateway::spawn_listener`](super::RpcGateway::spawn_listener).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Host is not set
    /// - Connection fails or times out
    /// - The reply subscription cannot be queued
    pub async fn build(
        self,
    ) -> Result<(MqttRpcTransport, mpsc::UnboundedReceiver<RpcResponse>), RpcError> {
        if self.config.host.is_empty() {
            return Err(RpcError::ConnectionFailed(
                "MQTT broker host is required".to_string(),
            ));
        }

        let client_id = next_client_id();
        let reply_topic = self.config.reply_topic_for(&client_id);

        let mut mqtt_options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        let transport = MqttRpcTransport {
            inner: Arc::new(TransportInner {
                client,
                config: self.config.clone(),
                reply_topic,
                connected: AtomicBool::new(false),
            }),
        };

        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (connack_tx, connack_rx) = oneshot::channel();

        let loop_transport = transport.clone();
        tokio::spawn(async move {
            handle_transport_events(event_loop, loop_transport, replies_tx, Some(connack_tx)).await;
        });

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                transport.inner.connected.store(true, Ordering::Release);
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    reply_topic = %transport.inner.reply_topic,
                    "RPC transport connected to MQTT broker"
                );
            }
            Ok(Err(_)) => {
                return Err(RpcError::ConnectionFailed(
                    "MQTT event loop terminated unexpectedly".to_string(),
                ));
            }
            Err(_) => {
                return Err(RpcError::ConnectionFailed(format!(
                    "MQTT connection timeout after {}s",
                    timeout.as_secs()
                )));
            }
        }

        transport
            .inner
            .client
            .subscribe(transport.inner.reply_topic.as_str(), QoS::AtLeastOnce)
            .await?;

        Ok((transport, replies_rx))
    }
}

/// A client id unique within this process.
fn next_client_id() -> String {
    let counter = TRANSPORT_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("hivebus_{}_{}", std::process::id(), counter)
}

/// Decodes a publish received on `topic`.
///
/// Returns `None` for other topics and for payloads that are not replies.
fn decode_reply(reply_topic: &str, topic: &str, payload: &[u8]) -> Option<RpcResponse> {
    if topic != reply_topic {
        return None;
    }
    match serde_json::from_slice::<RpcResponse>(payload) {
        Ok(response) => Some(response),
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Discarding undecodable RPC reply");
            None
        }
    }
}

/// Drives the MQTT event loop and forwards replies.
async fn handle_transport_events(
    mut event_loop: EventLoop,
    transport: MqttRpcTransport,
    replies: mpsc::UnboundedSender<RpcResponse>,
    connack_tx: Option<oneshot::Sender<()>>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = connack_tx;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                transport.inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(response) =
                    decode_reply(&transport.inner.reply_topic, &publish.topic, &publish.payload)
                else {
                    continue;
                };
                tracing::trace!(correlation = %response.correlation_id, "RPC reply received");
                if replies.send(response).is_err() {
                    tracing::debug!("RPC reply listener gone, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                transport.inner.connected.store(false, Ordering::Release);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT transport event loop error");
                transport.inner.connected.store(false, Ordering::Release);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CorrelationId;
    use serde_json::json;

    #[test]
    fn reply_topic_is_scoped_to_the_client_unless_fixed() {
        let config = MqttTransportConfig::default();
        assert_eq!(config.request_topic, DEFAULT_REQUEST_TOPIC);
        assert_eq!(config.reply_topic_for("hivebus_7_0"), "hivebus/reply/hivebus_7_0");

        let fixed = MqttRpcTransportBuilder::default()
            .reply_topic("backend/replies/hub-1")
            .config;
        assert_eq!(fixed.reply_topic_for("hivebus_7_0"), "backend/replies/hub-1");
    }

    #[test]
    fn client_ids_differ_per_transport() {
        let a = next_client_id();
        let b = next_client_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("hivebus_{}_", std::process::id())));
    }

    #[test]
    fn replies_on_the_reply_topic_are_decoded() {
        let id = CorrelationId::new();
        let payload = serde_json::to_vec(&RpcResponse::reply(id, json!({"ok": true}))).unwrap();

        let response = decode_reply("hub/replies", "hub/replies", &payload).unwrap();
        assert_eq!(response.correlation_id, id);
        assert!(response.last);
        assert_eq!(response.body["ok"], true);
    }

    #[test]
    fn foreign_topics_and_garbage_are_dropped() {
        let payload =
            serde_json::to_vec(&RpcResponse::failure(CorrelationId::new(), 500, "boom")).unwrap();
        assert!(decode_reply("hub/replies", "other/replies", &payload).is_none());
        assert!(decode_reply("hub/replies", "hub/replies", b"not json").is_none());
    }

    #[tokio::test]
    async fn build_without_broker_host_fails() {
        let result = MqttRpcTransport::builder().port(1883).build().await;
        assert!(matches!(result, Err(RpcError::ConnectionFailed(_))));
    }
}
