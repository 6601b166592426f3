// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! The inter-server `MessageBus` for loosely coupled message passing patterns.
//!
//! The bus provides Pub/Sub over hierarchical dotted message types,
//! direct point-to-point sends addressed by server ID, and Req/Rep with
//! correlation-id matching, over a pluggable transport.
//!
//! Pub/Sub wildcard patterns for hierarchical message types are possible:
//!  - `*` asterisk represents zero or more characters in a pattern.
//!  - `?` question mark represents a single character in a pattern.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod handler;
pub mod matching;
pub mod stubs;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod tests;

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fulcrum_core::{ServerId, UUID4, correctness::check_valid_string};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use ustr::Ustr;

use crate::{
    logging::{log_task_awaiting, log_task_started, log_task_stopped},
    runtime::get_runtime,
};
use self::{
    codec::{CodecRegistry, DecodedPayload},
    envelope::MessageEnvelope,
    handler::ShareableBusHandler,
    subscriptions::{SubscriptionRegistry, SubscriptionToken},
    transport::{BusTransport, InProcessNetwork, InProcessTransport},
};

/// The sentinel message type unblocking a bus consumer during shutdown.
pub const CLOSE_MESSAGE_TYPE: &str = "CLOSE";

/// The capacity of each bus instance's bounded incoming queue.
pub const INCOMING_QUEUE_CAPACITY: usize = 100_000;

const BUS_CONSUMER: &str = "msgbus-consumer";
const BUS_CLEANUP: &str = "msgbus-cleanup";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The error surface of the message bus core.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization failed for message type '{message_type}': {cause}")]
    SerializationFailed {
        message_type: Ustr,
        cause: anyhow::Error,
    },
    #[error("deserialization failed for message type '{message_type}': {cause}")]
    DeserializationFailed {
        message_type: Ustr,
        cause: anyhow::Error,
    },
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("request timed out after {timeout:?}")]
    RequestTimedOut { timeout: Duration },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

/// A message bus connecting one server to its cluster peers.
///
/// Every mutating operation is safe to invoke from any thread and never blocks
/// the caller: outbound work is suspended on the transport, inbound envelopes
/// are consumed by a dedicated task that deserializes payloads and hands them
/// to dispatch.
pub struct MessageBus {
    /// The server ID this bus sends from and receives direct envelopes for.
    pub server_id: ServerId,
    /// The unique instance ID for this bus.
    pub instance_id: UUID4,
    codec: Arc<CodecRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    transport: Arc<dyn BusTransport>,
    incoming_tx: mpsc::Sender<MessageEnvelope>,
    default_timeout: Duration,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(MessageBus))
            .field("server_id", &self.server_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl MessageBus {
    /// Assembles a bus over an already-constructed transport and starts its
    /// consumer and correlation-cleanup tasks.
    ///
    /// The `incoming_tx`/`incoming_rx` pair must be the channel handed to the
    /// transport at construction.
    #[must_use]
    pub fn start(
        server_id: ServerId,
        instance_id: UUID4,
        codec: Arc<CodecRegistry>,
        transport: Arc<dyn BusTransport>,
        incoming_tx: mpsc::Sender<MessageEnvelope>,
        incoming_rx: mpsc::Receiver<MessageEnvelope>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let consumer_handle = get_runtime().spawn(run_consumer(
            server_id,
            incoming_rx,
            codec.clone(),
            subscriptions.clone(),
        ));
        let cleanup_handle = get_runtime().spawn(run_cleanup(subscriptions.clone()));

        Arc::new(Self {
            server_id,
            instance_id,
            codec,
            subscriptions,
            transport,
            incoming_tx,
            default_timeout,
            consumer_handle: Mutex::new(Some(consumer_handle)),
            cleanup_handle: Mutex::new(Some(cleanup_handle)),
            closing: AtomicBool::new(false),
        })
    }

    /// Creates a bus on the in-process transport registered with `network`.
    #[must_use]
    pub fn in_process(
        server_id: ServerId,
        network: InProcessNetwork,
        codec: Arc<CodecRegistry>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        let transport = Arc::new(InProcessTransport::new(
            server_id,
            network,
            incoming_tx.clone(),
        ));
        Self::start(
            server_id,
            UUID4::new(),
            codec,
            transport,
            incoming_tx,
            incoming_rx,
            default_timeout,
        )
    }

    /// Returns the codec registry payload types are registered with.
    #[must_use]
    pub fn codec(&self) -> &Arc<CodecRegistry> {
        &self.codec
    }

    /// Returns whether the transport can currently deliver envelopes.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::Relaxed) && self.transport.is_connected()
    }

    /// Returns the count of local subscriptions covering `message_type`.
    #[must_use]
    pub fn subscriptions_count(&self, message_type: &str) -> usize {
        self.subscriptions
            .subscriptions_count(Ustr::from(message_type))
    }

    /// Subscribes `handler` to the exact `message_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if `message_type` is blank.
    pub fn subscribe(
        &self,
        message_type: &str,
        handler: ShareableBusHandler,
    ) -> Result<SubscriptionToken, BusError> {
        check_valid_string(message_type, stringify!(message_type))
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        log::debug!("Subscribing handler {} to '{message_type}'", handler.id());
        Ok(self
            .subscriptions
            .subscribe(Ustr::from(message_type), handler))
    }

    /// Subscribes `handler` to every message type matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is blank.
    pub fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: ShareableBusHandler,
    ) -> Result<SubscriptionToken, BusError> {
        check_valid_string(pattern, stringify!(pattern))
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        log::debug!("Subscribing handler {} to pattern '{pattern}'", handler.id());
        Ok(self
            .subscriptions
            .subscribe_pattern(Ustr::from(pattern), handler))
    }

    /// Revokes the binding created by a subscribe call; missing bindings are
    /// silently ignored.
    pub fn unsubscribe(&self, token: &SubscriptionToken) {
        log::debug!("Unsubscribing handler {} from '{}'", token.handler_id, token.topic);
        self.subscriptions.unsubscribe(token);
    }

    /// Broadcasts `payload` to every connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if `message_type` is blank, serialization fails, or
    /// the transport is unavailable.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        let envelope = self.make_envelope(message_type, None, payload, None)?;
        self.publish_envelope(envelope).await.map(|_| ())
    }

    /// Sends `payload` directly to `target`.
    ///
    /// A send to an unknown or offline target is logged by the transport and
    /// completes successfully, preserving at-most-once best-effort semantics.
    ///
    /// # Errors
    ///
    /// Returns an error if `message_type` is blank, serialization fails, or
    /// the transport is unavailable.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        target: ServerId,
        message_type: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        let envelope = self.make_envelope(message_type, Some(target), payload, None)?;
        self.publish_envelope(envelope).await.map(|_| ())
    }

    /// Sends a request and awaits the first correlated response.
    ///
    /// Passing `target: None` broadcasts the request. The waiter completes
    /// with the first matching response payload; later responses find no
    /// waiter and are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::RequestTimedOut`] when no response arrives within
    /// `timeout` (or the bus default), or any send-path error.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        target: Option<ServerId>,
        message_type: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<DecodedPayload, BusError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let envelope = self.make_envelope(message_type, target, payload, None)?;
        let request_id = envelope.id;

        let receiver = self.subscriptions.register_waiter(request_id, timeout);
        if let Err(e) = self.publish_envelope(envelope).await {
            self.subscriptions.remove_waiter(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::RequestTimedOut { timeout }),
            Err(_) => {
                self.subscriptions.remove_waiter(request_id);
                Err(BusError::RequestTimedOut { timeout })
            }
        }
    }

    /// Sends `payload` to the source of `request`, correlated to its id.
    ///
    /// # Errors
    ///
    /// Returns an error if `message_type` is blank, serialization fails, or
    /// the transport is unavailable.
    pub async fn reply<T: Serialize + ?Sized>(
        &self,
        request: &MessageEnvelope,
        message_type: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        let envelope = self.make_envelope(
            message_type,
            Some(request.source_server),
            payload,
            Some(request.id),
        )?;
        self.publish_envelope(envelope).await.map(|_| ())
    }

    /// Shuts the bus down: stops its tasks, closes the transport, and clears
    /// every subscription and pending waiter. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if closing the transport fails.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Shutting down bus '{}'", self.server_id);

        // Unblock the consumer, then drain within the grace period
        let close = MessageEnvelope::new(
            Ustr::from(CLOSE_MESSAGE_TYPE),
            self.server_id,
            Some(self.server_id),
            codec::NULL_LITERAL.to_string(),
            None,
        );
        let _ = self.incoming_tx.try_send(close);

        self.transport.close().await?;

        let consumer = self.consumer_handle.lock().unwrap().take();
        await_task(consumer, BUS_CONSUMER).await;

        if let Some(cleanup) = self.cleanup_handle.lock().unwrap().take() {
            cleanup.abort();
        }

        self.subscriptions.clear();
        log::debug!("Bus '{}' shut down", self.server_id);
        Ok(())
    }

    fn make_envelope<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        target_server: Option<ServerId>,
        payload: &T,
        correlation_id: Option<UUID4>,
    ) -> Result<MessageEnvelope, BusError> {
        check_valid_string(message_type, stringify!(message_type))
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        let message_type = Ustr::from(message_type);
        let text = self.codec.serialize(message_type, payload)?;
        Ok(MessageEnvelope::new(
            message_type,
            self.server_id,
            target_server,
            text,
            correlation_id,
        ))
    }

    async fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<u64, BusError> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(BusError::TransportUnavailable);
        }
        self.transport.publish(envelope).await
    }
}

async fn await_task(handle: Option<JoinHandle<()>>, task_name: &str) {
    if let Some(mut handle) = handle {
        log_task_awaiting(task_name);
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Error awaiting task '{task_name}': {e:?}"),
            Err(_) => {
                log::error!("Timeout {SHUTDOWN_GRACE:?} awaiting task '{task_name}', aborting");
                handle.abort();
            }
        }
    }
}

async fn run_consumer(
    server_id: ServerId,
    mut incoming_rx: mpsc::Receiver<MessageEnvelope>,
    codec: Arc<CodecRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
) {
    log_task_started(BUS_CONSUMER);

    while let Some(envelope) = incoming_rx.recv().await {
        if envelope.message_type.as_str() == CLOSE_MESSAGE_TYPE
            && envelope.source_server == server_id
        {
            log::debug!("Received close envelope");
            break;
        }

        // Drop envelopes addressed elsewhere
        if let Some(target) = envelope.target_server {
            if target != server_id {
                log::debug!("Dropping envelope addressed to '{target}'");
                continue;
            }
        }

        // Own broadcasts dispatch only for intra-process fanout; self-addressed
        // direct sends always dispatch
        if envelope.is_broadcast()
            && envelope.source_server == server_id
            && !subscriptions.has_local_subscribers(envelope.message_type)
        {
            continue;
        }

        match codec.deserialize(envelope.message_type, &envelope.payload) {
            Ok(payload) => subscriptions.dispatch(&envelope, &payload),
            Err(e) => log::error!("Dropping envelope {envelope}: {e}"),
        }
    }

    log_task_stopped(BUS_CONSUMER);
}

async fn run_cleanup(subscriptions: Arc<SubscriptionRegistry>) {
    log_task_started(BUS_CLEANUP);

    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.tick().await; // first tick resolves immediately
    loop {
        interval.tick().await;
        let expired = subscriptions.cleanup_expired_waiters();
        if expired > 0 {
            log::debug!("Expired {expired} correlation waiter(s)");
        }
    }
}
