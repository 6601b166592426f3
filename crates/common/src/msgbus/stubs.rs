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

//! Stub handlers for message bus testing.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::{
    envelope::MessageEnvelope,
    handler::{ShareableBusHandler, TypedBusHandler},
};

/// Returns a handler counting its invocations via the shared counter.
#[must_use]
pub fn get_counting_handler() -> (ShareableBusHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let handler = TypedBusHandler::with_any(move |_: &dyn Any, _: &MessageEnvelope| {
        calls_clone.fetch_add(1, Ordering::Relaxed);
    });
    (ShareableBusHandler(Arc::new(handler)), calls)
}

/// Returns a handler recording every received payload (as a generic JSON
/// value, where applicable) together with its envelope.
#[must_use]
#[allow(clippy::type_complexity)]
pub fn get_collecting_handler() -> (
    ShareableBusHandler,
    Arc<Mutex<Vec<(serde_json::Value, MessageEnvelope)>>>,
) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let handler = TypedBusHandler::with_any(move |payload: &dyn Any, envelope: &MessageEnvelope| {
        let value = payload
            .downcast_ref::<serde_json::Value>()
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        received_clone
            .lock()
            .unwrap()
            .push((value, envelope.clone()));
    });
    (ShareableBusHandler(Arc::new(handler)), received)
}

/// Returns a handler that panics on every invocation.
#[must_use]
pub fn get_panicking_handler() -> ShareableBusHandler {
    let handler = TypedBusHandler::with_any(|_: &dyn Any, _: &MessageEnvelope| {
        panic!("handler failure");
    });
    ShareableBusHandler(Arc::new(handler))
}
