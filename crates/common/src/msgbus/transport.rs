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

//! Transport contract and the in-process multiplexer.
//!
//! The in-process transport shares a registry of live bus instances within the
//! same runtime. It is a development and test vehicle, but enforces the same
//! routing rules as the production transport: broadcasts reach every peer
//! (including self), direct sends reach only the addressed peer, and sends to
//! unknown targets are logged and dropped.

use std::{
    fmt::Debug,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use fulcrum_core::ServerId;
use tokio::sync::mpsc;

use super::{BusError, envelope::MessageEnvelope};

/// A pluggable outbound transport for envelopes.
///
/// Incoming envelopes flow through the bounded channel handed to the transport
/// at construction, consumed by the owning bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Returns whether the transport can currently deliver envelopes.
    fn is_connected(&self) -> bool;

    /// Publishes `envelope`, routed by its target, returning the receiver
    /// count where the transport can know it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportUnavailable`] when disconnected, or a
    /// transport failure when delivery fails.
    async fn publish(&self, envelope: MessageEnvelope) -> Result<u64, BusError>;

    /// Closes the transport, releasing its resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing transport resources fails.
    async fn close(&self) -> Result<(), BusError>;
}

static DEFAULT_NETWORK: OnceLock<InProcessNetwork> = OnceLock::new();

/// A process-wide registry of live bus instances keyed by server ID.
///
/// Production composition uses the single [`InProcessNetwork::global`]
/// instance; tests construct private networks to isolate peers.
#[derive(Clone, Debug, Default)]
pub struct InProcessNetwork {
    peers: Arc<DashMap<ServerId, mpsc::Sender<MessageEnvelope>>>,
}

impl InProcessNetwork {
    /// Creates a new empty [`InProcessNetwork`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-global network instance.
    pub fn global() -> Self {
        DEFAULT_NETWORK.get_or_init(Self::new).clone()
    }

    /// Returns the count of registered peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn register(&self, server_id: ServerId, incoming: mpsc::Sender<MessageEnvelope>) {
        if self.peers.insert(server_id, incoming).is_some() {
            log::warn!("Replaced existing in-process peer '{server_id}'");
        }
    }

    fn deregister(&self, server_id: ServerId) {
        self.peers.remove(&server_id);
    }
}

/// In-process transport multiplexing envelopes between peers in one runtime.
#[derive(Debug)]
pub struct InProcessTransport {
    server_id: ServerId,
    network: InProcessNetwork,
    connected: AtomicBool,
}

impl InProcessTransport {
    /// Creates a new [`InProcessTransport`] instance registered on `network`.
    #[must_use]
    pub fn new(
        server_id: ServerId,
        network: InProcessNetwork,
        incoming: mpsc::Sender<MessageEnvelope>,
    ) -> Self {
        network.register(server_id, incoming);
        Self {
            server_id,
            network,
            connected: AtomicBool::new(true),
        }
    }

    fn offer(target: ServerId, sender: &mpsc::Sender<MessageEnvelope>, envelope: MessageEnvelope) -> bool {
        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::error!("Incoming queue full for peer '{target}', dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Peer '{target}' closed, dropping envelope");
                false
            }
        }
    }
}

#[async_trait]
impl BusTransport for InProcessTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn publish(&self, envelope: MessageEnvelope) -> Result<u64, BusError> {
        if !self.is_connected() {
            return Err(BusError::TransportUnavailable);
        }

        match envelope.target_server {
            None => {
                // Offer to every registered instance, including self
                let peers: Vec<(ServerId, mpsc::Sender<MessageEnvelope>)> = self
                    .network
                    .peers
                    .iter()
                    .map(|entry| (*entry.key(), entry.value().clone()))
                    .collect();

                let mut delivered = 0;
                for (peer_id, sender) in peers {
                    if Self::offer(peer_id, &sender, envelope.clone()) {
                        delivered += 1;
                    }
                }
                Ok(delivered)
            }
            Some(target) => {
                let sender = self.network.peers.get(&target).map(|entry| entry.value().clone());
                match sender {
                    Some(sender) => {
                        if Self::offer(target, &sender, envelope) {
                            Ok(1)
                        } else {
                            Ok(0)
                        }
                    }
                    None => {
                        log::warn!("Unknown target server '{target}', dropping envelope");
                        Ok(0)
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.network.deregister(self.server_id);
        }
        Ok(())
    }
}
