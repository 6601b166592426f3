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

//! End-to-end message bus scenarios over private in-process networks.

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use fulcrum_core::ServerId;
use serde_json::json;

use super::{BusError, MessageBus, codec::CodecRegistry};
use crate::{
    msgbus::{
        handler::{ShareableBusHandler, TypedBusHandler},
        stubs::{get_collecting_handler, get_counting_handler},
        transport::InProcessNetwork,
    },
    runtime::get_runtime,
    testing::wait_until_async,
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn make_bus(name: &str, network: &InProcessNetwork) -> Arc<MessageBus> {
    MessageBus::in_process(
        ServerId::from(name),
        network.clone(),
        Arc::new(CodecRegistry::default()),
        Duration::from_millis(5000),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_reaches_remote_subscriber() {
    let network = InProcessNetwork::new();
    let bus_a = make_bus("server-a", &network);
    let bus_b = make_bus("server-b", &network);

    let (handler, received) = get_collecting_handler();
    bus_b.subscribe("ping", handler).unwrap();

    bus_a.broadcast("ping", &json!({"x": 1})).await.unwrap();

    wait_until_async(|| async { !received.lock().unwrap().is_empty() }, TIMEOUT).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (payload, envelope) = &received[0];
    assert_eq!(payload, &json!({"x": 1}));
    assert_eq!(envelope.source_server, ServerId::from("server-a"));
    assert!(envelope.is_broadcast());

    drop(received);
    bus_a.shutdown().await.unwrap();
    bus_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_addressed_direct_send_dispatches() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    let (handler, received) = get_collecting_handler();
    bus.subscribe_pattern("chat.*", handler).unwrap();

    bus.send(bus.server_id, "chat.lobby", "hi").await.unwrap();

    wait_until_async(|| async { !received.lock().unwrap().is_empty() }, TIMEOUT).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, json!("hi"));

    drop(received);
    bus.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_own_broadcast_without_subscribers_is_filtered() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    let (handler, calls) = get_counting_handler();
    bus.subscribe("other.type", handler).unwrap();

    bus.broadcast("ping", &json!({"x": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    bus.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_own_broadcast_with_subscribers_fans_out_locally() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    let (handler_a, calls_a) = get_counting_handler();
    let (handler_b, calls_b) = get_counting_handler();
    bus.subscribe("ping", handler_a).unwrap();
    bus.subscribe("ping", handler_b).unwrap();

    bus.broadcast("ping", &json!({"x": 1})).await.unwrap();

    wait_until_async(
        || async { calls_a.load(Ordering::Relaxed) == 1 && calls_b.load(Ordering::Relaxed) == 1 },
        TIMEOUT,
    )
    .await;

    bus.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsubscribe_stops_delivery() {
    let network = InProcessNetwork::new();
    let bus_a = make_bus("server-a", &network);
    let bus_b = make_bus("server-b", &network);

    let (handler, calls) = get_counting_handler();
    let token = bus_b.subscribe("ping", handler).unwrap();

    bus_a.broadcast("ping", &json!(1)).await.unwrap();
    wait_until_async(|| async { calls.load(Ordering::Relaxed) == 1 }, TIMEOUT).await;

    bus_b.unsubscribe(&token);
    bus_a.broadcast("ping", &json!(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);

    bus_a.shutdown().await.unwrap();
    bus_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_resolves_with_first_reply() {
    let network = InProcessNetwork::new();
    let bus_a = make_bus("server-a", &network);
    let bus_b = make_bus("server-b", &network);

    // Responder echoes the request payload back via the reply primitive
    let responder = bus_b.clone();
    let handler = TypedBusHandler::with_any(move |payload: &dyn std::any::Any, envelope| {
        let value = payload
            .downcast_ref::<serde_json::Value>()
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let responder = responder.clone();
        let envelope = envelope.clone();
        get_runtime().spawn(async move {
            responder
                .reply(&envelope, "rpc.echo.reply", &value)
                .await
                .unwrap();
        });
    });
    bus_b
        .subscribe("rpc.echo", ShareableBusHandler(Arc::new(handler)))
        .unwrap();

    let response = bus_a
        .request(
            Some(bus_b.server_id),
            "rpc.echo",
            &json!({"v": "q"}),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(
        response.downcast_ref::<serde_json::Value>(),
        Some(&json!({"v": "q"}))
    );

    bus_a.shutdown().await.unwrap();
    bus_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_times_out_without_response() {
    let network = InProcessNetwork::new();
    let bus_a = make_bus("server-a", &network);
    let bus_b = make_bus("server-b", &network);

    let started = Instant::now();
    let result = bus_a
        .request(
            Some(bus_b.server_id),
            "rpc.echo",
            &json!({"v": "q"}),
            Some(Duration::from_millis(100)),
        )
        .await;

    assert!(matches!(result, Err(BusError::RequestTimedOut { .. })));
    assert!(started.elapsed() >= Duration::from_millis(100));

    bus_a.shutdown().await.unwrap();
    bus_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_to_unknown_target_completes() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    bus.send(ServerId::from("offline"), "ping", &json!(1))
        .await
        .unwrap();

    bus.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blank_message_type_is_invalid() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    let result = bus.broadcast("  ", &json!(1)).await;
    assert!(matches!(result, Err(BusError::InvalidArgument(_))));

    bus.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_is_idempotent() {
    let network = InProcessNetwork::new();
    let bus = make_bus("server-a", &network);

    assert!(bus.is_connected());
    bus.shutdown().await.unwrap();
    bus.shutdown().await.unwrap();

    assert!(!bus.is_connected());
    assert!(matches!(
        bus.broadcast("ping", &json!(1)).await,
        Err(BusError::TransportUnavailable)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registered_payload_type_dispatches_typed() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Ping {
        x: u64,
    }

    let network = InProcessNetwork::new();
    let codec = Arc::new(CodecRegistry::default());
    codec.register::<Ping>("ping").unwrap();

    let bus_a = MessageBus::in_process(
        ServerId::from("server-a"),
        network.clone(),
        codec.clone(),
        Duration::from_millis(5000),
    );
    let bus_b = MessageBus::in_process(
        ServerId::from("server-b"),
        network,
        codec,
        Duration::from_millis(5000),
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = TypedBusHandler::from(move |ping: &Ping, _envelope| {
        tx.send(ping.clone()).unwrap();
    });
    bus_b
        .subscribe("ping", ShareableBusHandler(Arc::new(handler)))
        .unwrap();

    bus_a.broadcast("ping", &Ping { x: 7 }).await.unwrap();

    let received = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(received, Some(Ping { x: 7 }));

    bus_a.shutdown().await.unwrap();
    bus_b.shutdown().await.unwrap();
}
