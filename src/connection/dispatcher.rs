// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-connection outbound queue and its flusher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::{ConnectionId, SubscriptionId};

/// Write side of a client connection.
///
/// Implemented by the connection-handling layer (a WebSocket session, for
/// instance). Messages are already serialized JSON.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one message to the client.
    async fn send(&self, message: &str) -> Result<(), TransportError>;
}

/// A [`Transport`] that forwards messages into an unbounded channel.
///
/// Useful when the socket writer runs in its own task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver its messages arrive on.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        self.tx
            .send(message.to_owned())
            .map_err(|_| TransportError::Closed)
    }
}

/// A queued message and the subscription it was produced for.
#[derive(Debug)]
struct Queued {
    subscription: Option<SubscriptionId>,
    message: String,
}

/// FIFO outbound queue drained by at most one flusher at a time.
///
/// Messages are written in enqueue order. If a write fails the connection is
/// considered gone: the rest of the queue is dropped and further enqueues are
/// refused.
pub struct DeliveryDispatcher {
    connection: ConnectionId,
    transport: Box<dyn Transport>,
    queue: Mutex<VecDeque<Queued>>,
    /// Held by the task currently draining the queue.
    flushing: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    delivered: AtomicU64,
}

impl DeliveryDispatcher {
    /// Creates a dispatcher writing to `transport`.
    #[must_use]
    pub fn new(connection: ConnectionId, transport: Box<dyn Transport>) -> Self {
        Self {
            connection,
            transport,
            queue: Mutex::new(VecDeque::new()),
            flushing: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        }
    }

    /// Appends a message to the queue.
    ///
    /// Returns `false` if the connection is closed and the message was dropped.
    pub fn enqueue(&self, message: String) -> bool {
        self.push(None, message)
    }

    /// Appends a message delivered on behalf of `subscription`.
    ///
    /// Such messages can be withdrawn with [`discard`](Self::discard) until
    /// they are written.
    pub fn enqueue_for(&self, subscription: SubscriptionId, message: String) -> bool {
        self.push(Some(subscription), message)
    }

    fn push(&self, subscription: Option<SubscriptionId>, message: String) -> bool {
        if self.is_closed() {
            tracing::trace!(connection = %self.connection, "Dropping message for closed connection");
            return false;
        }
        self.queue.lock().push_back(Queued {
            subscription,
            message,
        });
        true
    }

    /// Drops every queued message produced for `subscription`.
    ///
    /// Returns how many were dropped. Messages already taken by a flusher
    /// are not affected.
    pub fn discard(&self, subscription: SubscriptionId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|queued| queued.subscription != Some(subscription));
        let dropped = before - queue.len();
        drop(queue);

        if dropped > 0 {
            tracing::debug!(
                connection = %self.connection,
                subscription = %subscription,
                dropped,
                "Discarded queued messages"
            );
        }
        dropped
    }

    /// Writes queued messages until the queue is empty.
    ///
    /// Returns immediately if another task is already flushing; that task
    /// picks up anything enqueued before it finishes. Returns the number of
    /// messages this call wrote.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the first failed write. The queue is
    /// discarded and the dispatcher is closed.
    pub async fn flush(&self) -> Result<usize, TransportError> {
        let mut sent = 0;
        loop {
            let Ok(guard) = self.flushing.try_lock() else {
                return Ok(sent);
            };
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            loop {
                let next = self.queue.lock().pop_front();
                let Some(Queued { message, .. }) = next else { break };

                if let Err(e) = self.transport.send(&message).await {
                    self.closed.store(true, Ordering::Release);
                    let dropped = {
                        let mut queue = self.queue.lock();
                        let n = queue.len();
                        queue.clear();
                        n
                    };
                    tracing::warn!(
                        connection = %self.connection,
                        error = %e,
                        dropped,
                        "Transport write failed, dropping queued messages"
                    );
                    return Err(e);
                }

                sent += 1;
                self.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(connection = %self.connection, "Delivered message");
            }

            drop(guard);
            // Catch messages enqueued between the last pop and the release.
            if self.queue.lock().is_empty() {
                return Ok(sent);
            }
        }
    }

    /// Marks the dispatcher closed and discards anything still queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.lock().clear();
    }

    /// Returns `true` once the dispatcher is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of messages waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns the number of messages written so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DeliveryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryDispatcher")
            .field("connection", &self.connection)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
