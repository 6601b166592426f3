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

//! Codec registry mapping message-type strings to payload decoders.
//!
//! Serialization is field-oriented JSON; decoding uses the decoder registered
//! for the message type, or falls back to a generic [`serde_json::Value`]
//! mapping when no type is registered (lenient mode).

use std::{
    any::{Any, type_name},
    fmt::Debug,
    sync::Arc,
};

use dashmap::DashMap;
use fulcrum_core::correctness::check_valid_string;
use serde::{Serialize, de::DeserializeOwned};
use ustr::Ustr;

use super::BusError;

/// The textual form of a null payload on the wire.
pub const NULL_LITERAL: &str = "null";

/// A decoded payload as dispatched to subscribers.
///
/// Registered message types decode to their registered concrete type;
/// unregistered types decode to [`serde_json::Value`]. Handlers downcast.
pub type DecodedPayload = Arc<dyn Any + Send + Sync>;

type DecodeFn = Arc<dyn Fn(&str) -> anyhow::Result<DecodedPayload> + Send + Sync>;

struct CodecRegistration {
    type_name: &'static str,
    decode: DecodeFn,
}

/// Maps message-type strings to payload decoders.
///
/// The hot path (`deserialize` during dispatch) is read-only; registration is
/// expected at startup or lazily by services and atomically replaces any
/// previous registration for the same type.
pub struct CodecRegistry {
    registrations: DashMap<Ustr, CodecRegistration>,
    strict_types: bool,
}

impl Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(CodecRegistry))
            .field("registered", &self.registrations.len())
            .field("strict_types", &self.strict_types)
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl CodecRegistry {
    /// Creates a new [`CodecRegistry`] instance.
    ///
    /// With `strict_types` enabled, deserializing an unregistered message type
    /// is an error instead of falling back to a generic mapping.
    #[must_use]
    pub fn new(strict_types: bool) -> Self {
        Self {
            registrations: DashMap::new(),
            strict_types,
        }
    }

    /// Registers `T` as the payload type for `message_type`.
    ///
    /// Replaces any previous registration for the same type.
    ///
    /// # Errors
    ///
    /// Returns an error if `message_type` is blank.
    pub fn register<T>(&self, message_type: &str) -> Result<(), BusError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        check_valid_string(message_type, stringify!(message_type))
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;

        let decode: DecodeFn = Arc::new(|text| {
            let payload: T = serde_json::from_str(text)?;
            Ok(Arc::new(payload) as DecodedPayload)
        });
        self.registrations.insert(
            Ustr::from(message_type),
            CodecRegistration {
                type_name: type_name::<T>(),
                decode,
            },
        );
        Ok(())
    }

    /// Removes the registration for `message_type`, returning whether one existed.
    pub fn unregister(&self, message_type: &str) -> bool {
        self.registrations
            .remove(&Ustr::from(message_type))
            .is_some()
    }

    /// Returns whether a payload type is registered for `message_type`.
    #[must_use]
    pub fn is_registered(&self, message_type: &str) -> bool {
        self.registrations.contains_key(&Ustr::from(message_type))
    }

    /// Returns the registered payload type name for `message_type`.
    #[must_use]
    pub fn registered_type_name(&self, message_type: &str) -> Option<&'static str> {
        self.registrations
            .get(&Ustr::from(message_type))
            .map(|r| r.type_name)
    }

    /// Serializes `payload` to its textual wire form.
    ///
    /// A `None` payload (or unit) serializes to the `"null"` literal.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SerializationFailed`] when the encoder fails.
    pub fn serialize<T: Serialize + ?Sized>(
        &self,
        message_type: Ustr,
        payload: &T,
    ) -> Result<String, BusError> {
        serde_json::to_string(payload).map_err(|e| BusError::SerializationFailed {
            message_type,
            cause: e.into(),
        })
    }

    /// Deserializes `text` into a payload for `message_type`.
    ///
    /// The `"null"` literal and an empty string both yield a
    /// [`serde_json::Value::Null`] payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DeserializationFailed`] when decoding fails, or in
    /// strict mode when no payload type is registered for `message_type`.
    pub fn deserialize(
        &self,
        message_type: Ustr,
        text: &str,
    ) -> Result<DecodedPayload, BusError> {
        if text.is_empty() || text == NULL_LITERAL {
            return Ok(Arc::new(serde_json::Value::Null));
        }

        if let Some(registration) = self.registrations.get(&message_type) {
            return (registration.decode)(text).map_err(|e| BusError::DeserializationFailed {
                message_type,
                cause: e,
            });
        }

        if self.strict_types {
            return Err(BusError::DeserializationFailed {
                message_type,
                cause: anyhow::anyhow!("no payload type registered"),
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| BusError::DeserializationFailed {
                message_type,
                cause: e.into(),
            })?;
        Ok(Arc::new(value))
    }
}
