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

use std::fmt::Display;

use chrono::{DateTime, Utc};
use fulcrum_core::{ServerId, UUID4};
use serde::{Deserialize, Serialize};
use ustr::Ustr;

/// Represents a bus message including a serialized payload and routing metadata.
///
/// The serde form is the wire contract shared with every other cluster peer:
/// keys are `id`, `messageType`, `sourceServer`, `targetServer`, `timestamp`
/// (ISO-8601), `correlationId`, and `payload` (the codec textual form).
/// Envelopes are immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// The unique id for the envelope, generated by the sending bus.
    pub id: UUID4,
    /// The semantic category of the payload, e.g. `fulcrum.registry.punishment.applied`.
    pub message_type: Ustr,
    /// The server the envelope originated from.
    pub source_server: ServerId,
    /// The addressed server, or `None` for a broadcast.
    pub target_server: Option<ServerId>,
    /// The envelope creation time at the source.
    pub timestamp: DateTime<Utc>,
    /// The request envelope id this envelope responds to, if any.
    pub correlation_id: Option<UUID4>,
    /// The codec-serialized payload. The literal `"null"` denotes a null payload.
    pub payload: String,
}

impl MessageEnvelope {
    /// Creates a new [`MessageEnvelope`] instance with a fresh id and timestamp.
    #[must_use]
    pub fn new(
        message_type: Ustr,
        source_server: ServerId,
        target_server: Option<ServerId>,
        payload: String,
        correlation_id: Option<UUID4>,
    ) -> Self {
        debug_assert!(!message_type.is_empty());
        Self {
            id: UUID4::new(),
            message_type,
            source_server,
            target_server,
            timestamp: Utc::now(),
            correlation_id,
            payload,
        }
    }

    /// Returns whether the envelope is addressed to every connected peer.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target_server.is_none()
    }

    /// Returns whether the envelope is a response correlated to `request_id`.
    #[must_use]
    pub fn is_response_to(&self, request_id: UUID4) -> bool {
        self.correlation_id == Some(request_id)
    }
}

impl Display for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} -> {}",
            self.message_type,
            self.source_server,
            self.target_server
                .map_or_else(|| "*".to_string(), |t| t.to_string()),
        )
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn stub_envelope(target: Option<ServerId>) -> MessageEnvelope {
        MessageEnvelope::new(
            Ustr::from("chat.lobby"),
            ServerId::from("lobby-01"),
            target,
            "{\"text\":\"hi\"}".to_string(),
            None,
        )
    }

    #[rstest]
    fn test_is_broadcast() {
        assert!(stub_envelope(None).is_broadcast());
        assert!(!stub_envelope(Some(ServerId::from("game-01"))).is_broadcast());
    }

    #[rstest]
    fn test_is_response_to() {
        let request_id = UUID4::new();
        let mut envelope = stub_envelope(None);
        assert!(!envelope.is_response_to(request_id));

        envelope = MessageEnvelope {
            correlation_id: Some(request_id),
            ..envelope
        };
        assert!(envelope.is_response_to(request_id));
        assert!(!envelope.is_response_to(UUID4::new()));
    }

    #[rstest]
    fn test_wire_keys_are_exact() {
        let envelope = stub_envelope(None);
        let value = serde_json::to_value(&envelope).unwrap();
        let object = value.as_object().unwrap();

        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "correlationId",
                "id",
                "messageType",
                "payload",
                "sourceServer",
                "targetServer",
                "timestamp",
            ]
        );
        // Broadcasts keep an explicit null target on the wire
        assert!(object["targetServer"].is_null());
        assert!(object["correlationId"].is_null());
        assert!(object["timestamp"].is_string());
    }

    #[rstest]
    fn test_wire_round_trip() {
        let envelope = stub_envelope(Some(ServerId::from("game-02")));
        let wire = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[rstest]
    fn test_display() {
        let envelope = stub_envelope(None);
        assert_eq!(format!("{envelope}"), "[chat.lobby] lobby-01 -> *");
    }

    #[rstest]
    fn test_ids_unique_per_envelope() {
        assert_ne!(stub_envelope(None).id, stub_envelope(None).id);
    }
}
