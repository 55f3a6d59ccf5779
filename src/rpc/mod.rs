// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/reply channel to the backend services.
//!
//! Requests travel as [`RpcRequest`] envelopes through an [`RpcTransport`];
//! replies come back as [`RpcResponse`]s on a separate listener channel and
//! are matched to their request by [`CorrelationId`].
//!
//! - [`RpcGateway`] - the pending-request table and reply resolution
//! - [`RpcBackend`] - entity queries and event storage over the gateway
//! - `MqttRpcTransport` - broker-backed transport (feature `mqtt`)

mod backend;
mod gateway;
#[cfg(feature = "mqtt")]
mod mqtt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::model::CorrelationId;

pub use backend::{RequestBody, ResponseBody, RpcBackend};
pub use gateway::{ReplyHandle, ReplyStream, RpcGateway};
#[cfg(feature = "mqtt")]
pub use mqtt::{DEFAULT_REQUEST_TOPIC, MqttRpcTransport, MqttRpcTransportBuilder, MqttTransportConfig};

/// What a request asks of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Liveness probe; the backend echoes it back.
    Ping,
    /// A regular request carrying a body.
    Client,
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Links the request to its replies.
    pub correlation_id: CorrelationId,
    /// Where the backend should send replies.
    pub reply_to: Option<String>,
    /// Routing hint so related requests are handled in order.
    pub partition_key: Option<String>,
    /// `false` when several replies are expected.
    pub single_reply: bool,
    /// Request kind.
    pub kind: RequestKind,
    /// Request payload.
    pub body: Value,
}

impl RpcRequest {
    /// Creates a single-reply request carrying `body`.
    #[must_use]
    pub fn new(body: Value) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            reply_to: None,
            partition_key: None,
            single_reply: true,
            kind: RequestKind::Client,
            body,
        }
    }

    /// Creates a ping request.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            kind: RequestKind::Ping,
            ..Self::new(Value::Null)
        }
    }

    /// Sets the partition key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Marks the request as expecting several replies.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.single_reply = false;
        self
    }
}

/// Reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Correlation id of the request being answered.
    pub correlation_id: CorrelationId,
    /// `true` on the final reply of a stream (always set for single replies).
    pub last: bool,
    /// `true` if the backend failed to handle the request.
    pub failed: bool,
    /// Status code accompanying a failure.
    pub error_code: Option<u16>,
    /// Reply payload, or the failure description.
    pub body: Value,
}

impl RpcResponse {
    /// A successful final reply.
    #[must_use]
    pub fn reply(correlation_id: CorrelationId, body: Value) -> Self {
        Self {
            correlation_id,
            last: true,
            failed: false,
            error_code: None,
            body,
        }
    }

    /// A successful intermediate reply of a stream.
    #[must_use]
    pub fn partial(correlation_id: CorrelationId, body: Value) -> Self {
        Self {
            last: false,
            ..Self::reply(correlation_id, body)
        }
    }

    /// A failed final reply.
    #[must_use]
    pub fn failure(correlation_id: CorrelationId, code: u16, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            last: true,
            failed: true,
            error_code: Some(code),
            body: Value::String(message.into()),
        }
    }

    /// Converts a failed reply into an error and returns the body otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Remote`] if the reply is a failure.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if !self.failed {
            return Ok(self.body);
        }
        let message = match self.body {
            Value::String(message) => message,
            other => other.to_string(),
        };
        Err(RpcError::Remote {
            code: self.error_code.unwrap_or(500),
            message,
        })
    }
}

/// Carries requests to the backend.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Hands a request over for delivery.
    async fn send(&self, request: &RpcRequest) -> Result<(), RpcError>;

    /// Address replies should be sent to, stamped on every request.
    fn reply_to(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_is_camel_case() {
        let request = RpcRequest::new(json!({"action": "list_networks"})).with_partition_key("D1");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["singleReply"], true);
        assert_eq!(value["partitionKey"], "D1");
        assert_eq!(value["kind"], "client");
        assert!(value["correlationId"].is_string());
    }

    #[test]
    fn ping_has_no_body() {
        let ping = RpcRequest::ping();
        assert_eq!(ping.kind, RequestKind::Ping);
        assert!(ping.body.is_null());
        assert!(ping.single_reply);
    }

    #[test]
    fn failure_becomes_remote_error() {
        let response = RpcResponse::failure(CorrelationId::new(), 404, "device not found");
        let err = response.into_result().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote { code: 404, ref message } if message == "device not found"
        ));
    }

    #[test]
    fn success_yields_body() {
        let response = RpcResponse::reply(CorrelationId::new(), json!([1, 2]));
        assert_eq!(response.into_result().unwrap(), json!([1, 2]));
    }
}
