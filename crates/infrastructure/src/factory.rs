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

//! Composes a `MessageBus` from adapter configuration.

use std::sync::Arc;

use fulcrum_common::msgbus::{
    BusError, INCOMING_QUEUE_CAPACITY, MessageBus,
    codec::CodecRegistry,
    config::MessageBusConfig,
    transport::{BusTransport, InProcessNetwork, InProcessTransport},
};
use fulcrum_core::{ServerId, UUID4};
use tokio::sync::mpsc;

use crate::redis::msgbus::RedisTransport;

/// The configuration value selecting the Redis transport.
pub const TRANSPORT_REDIS: &str = "redis";

/// The configuration value selecting the in-process transport.
pub const TRANSPORT_IN_MEMORY: &str = "in-memory";

/// Creates a [`MessageBus`] for `server_id` with the transport selected by
/// `config`: development mode or `"in-memory"` yields the in-process
/// transport on the process-global network, `"redis"` the Redis pub/sub
/// transport.
///
/// # Errors
///
/// Returns [`BusError::ConfigurationInvalid`] for an unrecognized transport
/// type or a `redis` selection missing its connection settings, and a
/// transport failure if connecting to Redis fails.
pub async fn create_message_bus(
    server_id: ServerId,
    config: &MessageBusConfig,
) -> Result<Arc<MessageBus>, BusError> {
    let codec = Arc::new(CodecRegistry::new(config.strict_types));
    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_CAPACITY);

    let transport: Arc<dyn BusTransport> =
        if config.development_mode || config.transport_type == TRANSPORT_IN_MEMORY {
            Arc::new(InProcessTransport::new(
                server_id,
                InProcessNetwork::global(),
                incoming_tx.clone(),
            ))
        } else if config.transport_type == TRANSPORT_REDIS {
            let redis_config = config.redis.as_ref().ok_or_else(|| {
                BusError::ConfigurationInvalid("missing 'redis' section".to_string())
            })?;
            if redis_config.host.is_none() {
                return Err(BusError::ConfigurationInvalid(
                    "missing 'redis.host'".to_string(),
                ));
            }
            if redis_config.port.is_none() {
                return Err(BusError::ConfigurationInvalid(
                    "missing 'redis.port'".to_string(),
                ));
            }
            if redis_config.database > 15 {
                return Err(BusError::ConfigurationInvalid(format!(
                    "'redis.database' out of range (0-15), was {}",
                    redis_config.database
                )));
            }
            let transport = RedisTransport::connect(server_id, redis_config, incoming_tx.clone())
                .await
                .map_err(BusError::Transport)?;
            Arc::new(transport)
        } else {
            return Err(BusError::ConfigurationInvalid(format!(
                "unrecognized transport type '{}'",
                config.transport_type
            )));
        };

    Ok(MessageBus::start(
        server_id,
        UUID4::new(),
        codec,
        transport,
        incoming_tx,
        incoming_rx,
        config.message_timeout(),
    ))
}
