// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `hivebus` library.
//!
//! The hierarchy mirrors the ways a subscribe, publish or delivery can fail:
//! request validation, entity lookup and permission checks, client transport
//! writes, and the remote-procedure channel to backend services.
//!
//! Replies that arrive for an unknown correlation id are not represented here.
//! They are logged and counted by the [`RpcGateway`](crate::rpc::RpcGateway)
//! and never reach a caller.

use thiserror::Error;

use crate::model::{ConnectionId, SubscriptionId};

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Subscribe or publish parameters were rejected before any mutation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A referenced device, network or device type does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not permitted to access the referenced entity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Writing to a client connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A backend call failed.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The connection is not (or no longer) registered with the hub.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The subscription is not owned by the connection.
    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the HTTP-style status code reported to the requesting connection.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Json(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) | Self::SubscriptionNotFound(_) | Self::ConnectionNotFound(_) => 404,
            Self::Rpc(RpcError::Remote { code, .. }) => *code,
            Self::Rpc(RpcError::Timeout(_)) => 504,
            Self::Transport(_) | Self::Rpc(_) => 500,
        }
    }

    /// Returns `true` for errors caused by the request rather than the system.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// Errors raised while validating subscribe and publish parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An explicit `names` set was supplied but contained nothing.
    #[error("names must not be empty when provided")]
    EmptyNames,

    /// A sub-topic name was empty or whitespace.
    #[error("event names must not be blank")]
    BlankName,

    /// A device id was empty or whitespace.
    #[error("device id must not be blank")]
    BlankDeviceId,

    /// A replay limit of zero was requested.
    #[error("replay limit must be greater than zero")]
    ZeroLimit,

    /// A required field is missing.
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Errors raised while writing to a client connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// The underlying write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Errors raised by the remote-procedure channel to backend services.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request could not be handed to the transport.
    #[error("failed to send request: {0}")]
    SendFailed(String),

    /// No reply arrived within the caller's deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// The pending request was abandoned before a reply arrived.
    #[error("request abandoned before a reply arrived")]
    Abandoned,

    /// The backend answered with a failure.
    #[error("backend failure {code}: {message}")]
    Remote {
        /// Status code reported by the backend.
        code: u16,
        /// Failure description.
        message: String,
    },

    /// The reply body did not match the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The start-up ping never got an answer.
    #[error("backend unreachable after {attempts} ping attempts")]
    ServerUnreachable {
        /// Number of attempts made.
        attempts: u32,
    },

    /// MQTT client failure.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// MQTT connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
