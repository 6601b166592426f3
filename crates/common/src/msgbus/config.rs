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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for Redis connections.
///
/// # Notes
///
/// Requires Redis version 6.2 or higher for correct operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// The Redis host address. If `None`, the typical default should be used.
    pub host: Option<String>,
    /// The Redis port. If `None`, the typical default should be used.
    pub port: Option<u16>,
    /// The Redis database index (0-15).
    pub database: u8,
    /// The account username for the connection.
    pub username: Option<String>,
    /// The account password for the connection.
    pub password: Option<String>,
    /// If the connection should use SSL.
    pub ssl: bool,
    /// The timeout (in seconds) to wait for a new connection.
    pub connection_timeout: u16,
    /// The timeout (in seconds) to wait for a response.
    pub response_timeout: u16,
    /// The number of retry attempts with exponential backoff for connection attempts.
    pub number_of_retries: usize,
    /// The base value for exponential backoff calculation.
    pub exponent_base: u64,
    /// The maximum delay between retry attempts (in seconds).
    pub max_delay: u64,
    /// The multiplication factor for retry delay calculation.
    pub factor: u64,
    /// The connection pool ceiling.
    pub max_connections: u32,
}

impl Default for RedisConfig {
    /// Creates a new default [`RedisConfig`] instance.
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            database: 0,
            username: None,
            password: None,
            ssl: false,
            connection_timeout: 20,
            response_timeout: 20,
            number_of_retries: 100,
            exponent_base: 2,
            max_delay: 1000,
            factor: 2,
            max_connections: 8,
        }
    }
}

/// Configuration for `MessageBus` instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// The transport to use: `"redis"` or `"in-memory"`.
    #[serde(alias = "type")]
    pub transport_type: String,
    /// Forces the in-memory transport regardless of `transport_type`.
    pub development_mode: bool,
    /// The default deadline (milliseconds) for requests without an explicit timeout.
    pub message_timeout_ms: u64,
    /// If deserializing an unregistered message type is an error instead of
    /// falling back to a generic mapping.
    pub strict_types: bool,
    /// The Redis connection configuration. Required when `transport_type` is `"redis"`.
    pub redis: Option<RedisConfig>,
}

impl Default for MessageBusConfig {
    /// Creates a new default [`MessageBusConfig`] instance.
    fn default() -> Self {
        Self {
            transport_type: "redis".to_string(),
            development_mode: false,
            message_timeout_ms: 5000,
            strict_types: false,
            redis: None,
        }
    }
}

impl MessageBusConfig {
    /// Returns the default request deadline as a [`Duration`].
    #[must_use]
    pub const fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}
