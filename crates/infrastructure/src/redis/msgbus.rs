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

//! Redis pub/sub transport for the message bus.
//!
//! Every peer subscribes to the shared broadcast channel and to its own direct
//! channel. Envelopes cross the wire as the JSON wrapper defined by
//! [`MessageEnvelope`]'s serde form. Delivery inherits Redis pub/sub
//! at-most-once semantics: no replay, no durability.

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fulcrum_common::{
    logging::{log_task_started, log_task_stopped},
    msgbus::{BusError, config::RedisConfig, envelope::MessageEnvelope, transport::BusTransport},
    runtime::get_runtime,
};
use fulcrum_core::ServerId;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::{
    BROADCAST_CHANNEL, await_handle, create_redis_connection, direct_channel, get_redis_url,
};

const MSGBUS_PUBLISH: &str = "msgbus-publish";
const MSGBUS_LISTEN: &str = "msgbus-listen";
const MSGBUS_HEALTH: &str = "msgbus-health";
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Message bus transport over Redis pub/sub channels.
///
/// Publishing uses a managed connection with automatic reconnection; the
/// subscriber task owns a dedicated pub/sub connection. A periodic `PING`
/// marks the transport degraded on failure without terminating the process.
pub struct RedisTransport {
    server_id: ServerId,
    con: redis::aio::ConnectionManager,
    connected: Arc<AtomicBool>,
    signal: Arc<AtomicBool>,
    closed: AtomicBool,
    listen_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    health_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(RedisTransport))
            .field("server_id", &self.server_id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisTransport {
    /// Connects a new [`RedisTransport`] instance for `server_id`.
    ///
    /// Subscribes to the broadcast channel and to the server's own direct
    /// channel, then starts the listen and health tasks. Incoming envelopes
    /// are offered to `incoming`.
    ///
    /// # Errors
    ///
    /// Returns an error if establishing either Redis connection or the channel
    /// subscriptions fails.
    pub async fn connect(
        server_id: ServerId,
        config: &RedisConfig,
        incoming: mpsc::Sender<MessageEnvelope>,
    ) -> anyhow::Result<Self> {
        let con = create_redis_connection(MSGBUS_PUBLISH, config).await?;

        let (redis_url, _) = get_redis_url(config);
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(BROADCAST_CHANNEL).await?;
        pubsub.subscribe(direct_channel(server_id)).await?;

        let signal = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));

        let listen_handle = get_runtime().spawn(listen_messages(
            pubsub,
            server_id,
            incoming,
            signal.clone(),
        ));
        let health_handle = get_runtime().spawn(run_health_check(
            con.clone(),
            connected.clone(),
            signal.clone(),
        ));

        Ok(Self {
            server_id,
            con,
            connected,
            signal,
            closed: AtomicBool::new(false),
            listen_handle: Mutex::new(Some(listen_handle)),
            health_handle: Mutex::new(Some(health_handle)),
        })
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.connected.load(Ordering::Relaxed)
    }

    async fn publish(&self, envelope: MessageEnvelope) -> Result<u64, BusError> {
        if !self.is_connected() {
            return Err(BusError::TransportUnavailable);
        }

        let channel = envelope
            .target_server
            .map_or_else(|| BROADCAST_CHANNEL.to_string(), direct_channel);
        let wire = serde_json::to_string(&envelope).map_err(|e| BusError::SerializationFailed {
            message_type: envelope.message_type,
            cause: e.into(),
        })?;

        let mut con = self.con.clone();
        let receivers: u64 = con
            .publish(&channel, wire)
            .await
            .map_err(|e| BusError::Transport(e.into()))?;

        if receivers == 0 && !envelope.is_broadcast() {
            log::warn!("No subscriber on '{channel}', envelope {envelope} dropped");
        }
        Ok(receivers)
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Closing");

        self.signal.store(true, Ordering::Relaxed);

        let listen = self.listen_handle.lock().unwrap().take();
        await_handle(listen, MSGBUS_LISTEN).await;

        let health = self.health_handle.lock().unwrap().take();
        await_handle(health, MSGBUS_HEALTH).await;

        self.connected.store(false, Ordering::Relaxed);
        log::debug!("Closed");
        Ok(())
    }
}

async fn listen_messages(
    mut pubsub: redis::aio::PubSub,
    server_id: ServerId,
    incoming: mpsc::Sender<MessageEnvelope>,
    signal: Arc<AtomicBool>,
) {
    log_task_started(MSGBUS_LISTEN);

    {
        let mut stream = pubsub.on_message();
        let mut check_timer = tokio::time::interval(SIGNAL_POLL);

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(msg) => handle_message(&msg, &incoming),
                        None => {
                            tracing::warn!("Pub/sub connection closed");
                            break;
                        }
                    }
                }
                _ = check_timer.tick() => {
                    if signal.load(Ordering::Relaxed) {
                        tracing::debug!("Received listen terminate signal");
                        break;
                    }
                }
            }
        }
    }

    let _ = pubsub.unsubscribe(BROADCAST_CHANNEL).await;
    let _ = pubsub.unsubscribe(direct_channel(server_id)).await;

    log_task_stopped(MSGBUS_LISTEN);
}

fn handle_message(msg: &redis::Msg, incoming: &mpsc::Sender<MessageEnvelope>) {
    let wire: String = match msg.get_payload() {
        Ok(wire) => wire,
        Err(e) => {
            tracing::error!("Invalid pub/sub payload: {e}");
            return;
        }
    };

    match serde_json::from_str::<MessageEnvelope>(&wire) {
        Ok(envelope) => {
            if let Err(e) = incoming.try_send(envelope) {
                tracing::error!("Failed to enqueue envelope: {e}");
            }
        }
        Err(e) => tracing::error!("Invalid envelope wrapper: {e}"),
    }
}

async fn run_health_check(
    con: redis::aio::ConnectionManager,
    connected: Arc<AtomicBool>,
    signal: Arc<AtomicBool>,
) {
    log_task_started(MSGBUS_HEALTH);

    let mut ping_timer = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    let mut check_timer = tokio::time::interval(SIGNAL_POLL);

    loop {
        if signal.load(Ordering::Relaxed) {
            tracing::debug!("Received health terminate signal");
            break;
        }

        tokio::select! {
            _ = ping_timer.tick() => {
                let mut con = con.clone();
                let result: Result<String, redis::RedisError> =
                    redis::cmd("PING").query_async(&mut con).await;
                match result {
                    Ok(_) => {
                        if !connected.swap(true, Ordering::Relaxed) {
                            tracing::info!("Redis connection recovered");
                        }
                    }
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        tracing::warn!("Redis health check failed: {e}");
                    }
                }
            }
            _ = check_timer.tick() => {}
        }
    }

    log_task_stopped(MSGBUS_HEALTH);
}


#[cfg(target_os = "linux")] // Run Redis tests on Linux platforms only
#[cfg(test)]
mod serial_tests {
    use std::time::Duration;

    use rstest::rstest;
    use ustr::Ustr;

    use super::*;

    fn stub_envelope(source: &str, target: Option<&str>) -> MessageEnvelope {
        MessageEnvelope::new(
            Ustr::from("chat.lobby"),
            ServerId::from(source),
            target.map(ServerId::from),
            "\"hi\"".to_string(),
            None,
        )
    }

    #[rstest]
    #[ignore = "requires a local Redis server"]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_round_trip() {
        let config = RedisConfig::default();
        let (tx_a, mut rx_a) = mpsc::channel(100);
        let (tx_b, mut rx_b) = mpsc::channel(100);

        let transport_a = RedisTransport::connect(ServerId::from("peer-a"), &config, tx_a)
            .await
            .unwrap();
        let _transport_b = RedisTransport::connect(ServerId::from("peer-b"), &config, tx_b)
            .await
            .unwrap();

        let receivers = transport_a
            .publish(stub_envelope("peer-a", None))
            .await
            .unwrap();
        assert!(receivers >= 2);

        // Both peers receive the broadcast, including the sender
        let received = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.source_server, ServerId::from("peer-a"));
        let received = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_broadcast());

        transport_a.close().await.unwrap();
    }

    #[rstest]
    #[ignore = "requires a local Redis server"]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_direct_send_reaches_only_target() {
        let config = RedisConfig::default();
        let (tx_a, mut rx_a) = mpsc::channel(100);
        let (tx_b, mut rx_b) = mpsc::channel(100);

        let transport_a = RedisTransport::connect(ServerId::from("peer-a"), &config, tx_a)
            .await
            .unwrap();
        let _transport_b = RedisTransport::connect(ServerId::from("peer-b"), &config, tx_b)
            .await
            .unwrap();

        let receivers = transport_a
            .publish(stub_envelope("peer-a", Some("peer-b")))
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        let received = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.target_server, Some(ServerId::from("peer-b")));
        assert!(rx_a.try_recv().is_err());

        transport_a.close().await.unwrap();
    }

    #[rstest]
    #[ignore = "requires a local Redis server"]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_direct_send_to_offline_target_completes() {
        let config = RedisConfig::default();
        let (tx_a, _rx_a) = mpsc::channel(100);

        let transport_a = RedisTransport::connect(ServerId::from("peer-a"), &config, tx_a)
            .await
            .unwrap();

        let receivers = transport_a
            .publish(stub_envelope("peer-a", Some("offline")))
            .await
            .unwrap();
        assert_eq!(receivers, 0);

        transport_a.close().await.unwrap();
    }

    #[rstest]
    #[ignore = "requires a local Redis server"]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_idempotent() {
        let config = RedisConfig::default();
        let (tx_a, mut rx_a) = mpsc::channel(100);

        let transport = RedisTransport::connect(ServerId::from("peer-a"), &config, tx_a)
            .await
            .unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        // Listener has unsubscribed; nothing more arrives
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(
            transport.publish(stub_envelope("peer-a", None)).await,
            Err(BusError::TransportUnavailable)
        ));
    }
}
