// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending-request table and reply correlation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::model::CorrelationId;

use super::{RpcRequest, RpcResponse, RpcTransport};

/// Completion side of a pending request.
enum Pending {
    Single(oneshot::Sender<RpcResponse>),
    Stream(mpsc::UnboundedSender<RpcResponse>),
}

/// Awaitable reply to a single-reply request.
///
/// Resolves to [`RpcError::Abandoned`] if the request is abandoned before a
/// reply arrives.
#[derive(Debug)]
pub struct ReplyHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<RpcResponse>,
}

impl ReplyHandle {
    /// Returns the request's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Waits for the reply and converts it with `f`.
    ///
    /// # Errors
    ///
    /// Returns the abandonment error or whatever `f` returns.
    pub async fn map<T, F>(self, f: F) -> Result<T, RpcError>
    where
        F: FnOnce(RpcResponse) -> Result<T, RpcError>,
    {
        f(self.await?)
    }
}

impl Future for ReplyHandle {
    type Output = Result<RpcResponse, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| RpcError::Abandoned))
    }
}

/// Replies to a multi-reply request.
#[derive(Debug)]
pub struct ReplyStream {
    correlation_id: CorrelationId,
    rx: mpsc::UnboundedReceiver<RpcResponse>,
}

impl ReplyStream {
    /// Returns the request's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Receives the next reply; `None` after the last one or on abandonment.
    pub async fn next(&mut self) -> Option<RpcResponse> {
        self.rx.recv().await
    }
}

/// Sends requests and matches replies to them.
///
/// Each request registers a pending entry keyed by its correlation id before
/// it is transmitted. A single listener task feeds replies to
/// [`resolve`](Self::resolve), which completes and removes the entry. Replies
/// nobody waits for are logged and counted, never surfaced.
///
/// [`call`](Self::call) imposes no deadline on its own; use
/// [`call_with_timeout`](Self::call_with_timeout) or
/// [`request`](Self::request) to bound the wait.
pub struct RpcGateway {
    transport: Arc<dyn RpcTransport>,
    config: RpcConfig,
    pending: DashMap<CorrelationId, Pending>,
    unmatched: AtomicU64,
}

impl RpcGateway {
    /// Creates a gateway sending through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn RpcTransport>, config: RpcConfig) -> Self {
        Self {
            transport,
            config,
            pending: DashMap::new(),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Returns the gateway configuration.
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    fn stamp(&self, request: &mut RpcRequest) {
        if request.reply_to.is_none() {
            request.reply_to = self.transport.reply_to();
        }
    }

    async fn transmit(&self, request: &RpcRequest) -> Result<(), RpcError> {
        if let Err(e) = self.transport.send(request).await {
            self.pending.remove(&request.correlation_id);
            tracing::warn!(
                correlation = %request.correlation_id,
                error = %e,
                "Failed to send RPC request"
            );
            return Err(e);
        }
        tracing::trace!(correlation = %request.correlation_id, "Sent RPC request");
        Ok(())
    }

    /// Sends a single-reply request and returns a handle to its reply.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the request could not be sent; no
    /// pending entry is left behind.
    pub async fn call(&self, mut request: RpcRequest) -> Result<ReplyHandle, RpcError> {
        request.single_reply = true;
        self.stamp(&mut request);
        let correlation_id = request.correlation_id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, Pending::Single(tx));
        self.transmit(&request).await?;

        Ok(ReplyHandle { correlation_id, rx })
    }

    /// Sends a multi-reply request.
    ///
    /// The pending entry stays until a reply marked `last` arrives or the
    /// request is abandoned.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the request could not be sent.
    pub async fn call_stream(&self, request: RpcRequest) -> Result<ReplyStream, RpcError> {
        let mut request = request.streaming();
        self.stamp(&mut request);
        let correlation_id = request.correlation_id;

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(correlation_id, Pending::Stream(tx));
        self.transmit(&request).await?;

        Ok(ReplyStream { correlation_id, rx })
    }

    /// Sends a request without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the request could not be sent.
    pub async fn push(&self, mut request: RpcRequest) -> Result<(), RpcError> {
        self.stamp(&mut request);
        self.transmit(&request).await
    }

    /// Sends a request and waits at most `timeout` for the reply.
    ///
    /// On expiry the pending entry is abandoned, so a late reply is counted as
    /// unmatched.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] on expiry, or any send or abandonment error.
    pub async fn call_with_timeout(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let handle = self.call(request).await?;
        let correlation_id = handle.correlation_id();
        match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon(correlation_id);
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(correlation = %correlation_id, timeout_ms = ms, "RPC call timed out");
                Err(RpcError::Timeout(ms))
            }
        }
    }

    /// Sends a request under the configured call deadline and returns the
    /// reply body.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Remote`] for a failed reply, plus any error of
    /// [`call_with_timeout`](Self::call_with_timeout).
    pub async fn request(&self, request: RpcRequest) -> Result<Value, RpcError> {
        let response = match self.config.call_timeout {
            Some(timeout) => self.call_with_timeout(request, timeout).await?,
            None => self.call(request).await?.await?,
        };
        response.into_result()
    }

    /// Checks that the backend answers.
    ///
    /// Sends up to `ping_attempts` pings, each awaited for `ping_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ServerUnreachable`] if no ping is answered.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let attempts = self.config.ping_attempts;
        for attempt in 1..=attempts {
            match self
                .call_with_timeout(RpcRequest::ping(), self.config.ping_timeout)
                .await
            {
                Ok(_) => {
                    tracing::info!(attempt, "Backend answered ping");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(attempt, attempts, error = %e, "Ping attempt failed");
                }
            }
        }
        tracing::error!(attempts, "Backend unreachable");
        Err(RpcError::ServerUnreachable { attempts })
    }

    /// Completes the pending request a reply belongs to.
    ///
    /// Returns `false` if nothing was waiting for it.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let correlation_id = response.correlation_id;

        if !response.last
            && let Some(entry) = self.pending.get(&correlation_id)
            && let Pending::Stream(tx) = entry.value()
        {
            let _ = tx.send(response);
            return true;
        }

        match self.pending.remove(&correlation_id) {
            Some((_, Pending::Single(tx))) => {
                // The handle may have been dropped; the reply is then discarded.
                let _ = tx.send(response);
                true
            }
            Some((_, Pending::Stream(tx))) => {
                let _ = tx.send(response);
                true
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    correlation = %correlation_id,
                    "Discarding reply with unknown correlation id"
                );
                false
            }
        }
    }

    /// Drops a pending request; its handle resolves to [`RpcError::Abandoned`].
    pub fn abandon(&self, correlation_id: CorrelationId) -> bool {
        self.pending.remove(&correlation_id).is_some()
    }

    /// Drops every pending request, returning how many there were.
    pub fn abandon_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Returns the number of requests awaiting replies.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns how many replies arrived for unknown correlation ids.
    #[must_use]
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Spawns the response listener.
    ///
    /// The task resolves every reply received on `responses`. When the
    /// channel closes it abandons whatever is still pending and exits.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut responses: mpsc::UnboundedReceiver<RpcResponse>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                gateway.resolve(response);
            }
            let abandoned = gateway.abandon_all();
            tracing::info!(abandoned, "RPC response listener stopped");
        })
    }
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("pending", &self.pending_count())
            .field("unmatched", &self.unmatched_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
