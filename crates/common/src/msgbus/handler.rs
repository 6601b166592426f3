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

//! Message handler functionality for the message bus system.
//!
//! Handlers run on the bus dispatch task and must not block indefinitely;
//! long-running work is dispatched off the executor by the handler itself.

use std::{
    any::{Any, type_name},
    fmt::Debug,
    marker::PhantomData,
    sync::Arc,
};

use fulcrum_core::UUID4;
use ustr::Ustr;

use super::envelope::MessageEnvelope;

pub trait BusHandler: Send + Sync + 'static {
    /// Returns the unique identifier for this handler.
    fn id(&self) -> Ustr;
    /// Handles a decoded payload together with its envelope.
    fn handle(&self, payload: &dyn Any, envelope: &MessageEnvelope);
}

/// A handler invoking a callback with a payload downcast to `T`.
///
/// Payloads of any other concrete type are logged and skipped.
pub struct TypedBusHandler<T: ?Sized + 'static, F> {
    id: Ustr,
    callback: F,
    _phantom: PhantomData<fn(&T)>,
}

impl<T: 'static, F: Fn(&T, &MessageEnvelope) + Send + Sync + 'static> TypedBusHandler<T, F> {
    /// Creates a new handler with an optional custom ID.
    pub fn new<S: AsRef<str>>(id: Option<S>, callback: F) -> Self {
        let id = id.map_or_else(|| generate_handler_id(&callback), |s| Ustr::from(s.as_ref()));

        Self {
            id,
            callback,
            _phantom: PhantomData,
        }
    }

    /// Creates a new handler with an auto-generated ID.
    pub fn from(callback: F) -> Self {
        Self::new::<Ustr>(None, callback)
    }
}

impl<T: 'static, F: Fn(&T, &MessageEnvelope) + Send + Sync + 'static> BusHandler
    for TypedBusHandler<T, F>
{
    fn id(&self) -> Ustr {
        self.id
    }

    fn handle(&self, payload: &dyn Any, envelope: &MessageEnvelope) {
        if let Some(typed) = payload.downcast_ref::<T>() {
            (self.callback)(typed, envelope);
        } else {
            log::error!(
                "Expected payload of type {} for '{}'",
                type_name::<T>(),
                envelope.message_type
            );
        }
    }
}

impl<F: Fn(&dyn Any, &MessageEnvelope) + Send + Sync + 'static> TypedBusHandler<dyn Any, F> {
    /// Creates a new handler for dynamic payloads with an optional custom ID.
    pub fn new_any<S: AsRef<str>>(id: Option<S>, callback: F) -> Self {
        let id = id.map_or_else(|| generate_handler_id(&callback), |s| Ustr::from(s.as_ref()));

        Self {
            id,
            callback,
            _phantom: PhantomData,
        }
    }

    /// Creates a handler for dynamic payloads with an auto-generated ID.
    pub fn with_any(callback: F) -> Self {
        Self::new_any::<&str>(None, callback)
    }
}

impl<F: Fn(&dyn Any, &MessageEnvelope) + Send + Sync + 'static> BusHandler
    for TypedBusHandler<dyn Any, F>
{
    fn id(&self) -> Ustr {
        self.id
    }

    fn handle(&self, payload: &dyn Any, envelope: &MessageEnvelope) {
        (self.callback)(payload, envelope);
    }
}

fn generate_handler_id<F: 'static>(callback: &F) -> Ustr {
    let callback_ptr = std::ptr::from_ref(callback);
    let uuid = UUID4::new();
    Ustr::from(&format!("<{callback_ptr:?}>-{uuid}"))
}

/// A shareable reference-counted message handler.
#[repr(transparent)]
#[derive(Clone)]
pub struct ShareableBusHandler(pub Arc<dyn BusHandler>);

impl ShareableBusHandler {
    pub fn id(&self) -> Ustr {
        self.0.id()
    }
}

impl Debug for ShareableBusHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(ShareableBusHandler))
            .field("id", &self.0.id())
            .finish()
    }
}

impl From<Arc<dyn BusHandler>> for ShareableBusHandler {
    fn from(value: Arc<dyn BusHandler>) -> Self {
        Self(value)
    }
}
