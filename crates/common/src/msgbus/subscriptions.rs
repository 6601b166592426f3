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

//! Subscription registry and envelope dispatch.
//!
//! Holds the per-process tables of direct subscribers (exact message type),
//! pattern subscribers (glob over message types), and correlation waiters for
//! pending requests. Reads are lock-free; writes briefly contend on a slot.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use fulcrum_core::UUID4;
use tokio::sync::oneshot;
use ustr::Ustr;

use super::{
    BusError,
    codec::DecodedPayload,
    envelope::MessageEnvelope,
    handler::ShareableBusHandler,
    matching::is_matching,
};

/// Represents a subscription of a handler to a message type or pattern.
#[derive(Clone, Debug)]
pub struct Subscription {
    /// The shareable message handler for the subscription.
    pub handler: ShareableBusHandler,
    /// A copy of the handler ID for faster equality checks.
    pub handler_id: Ustr,
    /// The message type or pattern subscribed to.
    pub topic: Ustr,
}

impl Subscription {
    /// Creates a new [`Subscription`] instance.
    #[must_use]
    pub fn new<T: AsRef<str>>(topic: T, handler: ShareableBusHandler) -> Self {
        let handler_id = handler.id();
        Self {
            handler,
            handler_id,
            topic: Ustr::from(topic.as_ref()),
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic && self.handler_id == other.handler_id
    }
}

impl Eq for Subscription {}

/// Identifies which table a [`SubscriptionToken`] revokes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Direct,
    Pattern,
}

/// Revokes exactly the binding created by a subscribe call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionToken {
    pub topic: Ustr,
    pub handler_id: Ustr,
    pub kind: SubscriptionKind,
}

pub(crate) struct CorrelationWaiter {
    pub deadline: Instant,
    pub timeout: Duration,
    pub sender: oneshot::Sender<Result<DecodedPayload, BusError>>,
}

/// Per-process table of direct, pattern, and correlation subscribers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    direct: DashMap<Ustr, Vec<Subscription>>,
    patterns: DashMap<Ustr, Vec<Subscription>>,
    waiters: DashMap<UUID4, CorrelationWaiter>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(SubscriptionRegistry))
            .field("direct", &self.direct.len())
            .field("patterns", &self.patterns.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Creates a new empty [`SubscriptionRegistry`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to the exact `message_type`.
    ///
    /// Duplicate adds of the same handler are idempotent. Returns a token
    /// revoking exactly this binding.
    pub fn subscribe(&self, message_type: Ustr, handler: ShareableBusHandler) -> SubscriptionToken {
        let sub = Subscription::new(message_type, handler);
        let token = SubscriptionToken {
            topic: message_type,
            handler_id: sub.handler_id,
            kind: SubscriptionKind::Direct,
        };
        let mut subs = self.direct.entry(message_type).or_default();
        if !subs.contains(&sub) {
            subs.push(sub);
        }
        token
    }

    /// Subscribes `handler` to every message type matching `pattern`.
    pub fn subscribe_pattern(
        &self,
        pattern: Ustr,
        handler: ShareableBusHandler,
    ) -> SubscriptionToken {
        let sub = Subscription::new(pattern, handler);
        let token = SubscriptionToken {
            topic: pattern,
            handler_id: sub.handler_id,
            kind: SubscriptionKind::Pattern,
        };
        let mut subs = self.patterns.entry(pattern).or_default();
        if !subs.contains(&sub) {
            subs.push(sub);
        }
        token
    }

    /// Removes the binding identified by `token`; missing bindings are ignored.
    pub fn unsubscribe(&self, token: &SubscriptionToken) {
        let table = match token.kind {
            SubscriptionKind::Direct => &self.direct,
            SubscriptionKind::Pattern => &self.patterns,
        };
        if let Some(mut subs) = table.get_mut(&token.topic) {
            subs.retain(|s| s.handler_id != token.handler_id);
        }
        table.remove_if(&token.topic, |_, subs| subs.is_empty());
    }

    /// Returns whether any direct or pattern subscriber covers `message_type`.
    #[must_use]
    pub fn has_local_subscribers(&self, message_type: Ustr) -> bool {
        if self
            .direct
            .get(&message_type)
            .is_some_and(|subs| !subs.is_empty())
        {
            return true;
        }
        self.patterns
            .iter()
            .any(|entry| is_matching(message_type.as_bytes(), entry.key().as_bytes()))
    }

    /// Returns the subscriptions covering `message_type`, direct before pattern.
    #[must_use]
    pub fn matching_subscriptions(&self, message_type: Ustr) -> Vec<Subscription> {
        let mut matching = Vec::new();

        if let Some(subs) = self.direct.get(&message_type) {
            matching.extend(subs.iter().cloned());
        }

        for entry in self.patterns.iter() {
            if is_matching(message_type.as_bytes(), entry.key().as_bytes()) {
                matching.extend(entry.value().iter().cloned());
            }
        }

        matching
    }

    /// Returns the count of subscriptions covering `message_type`.
    #[must_use]
    pub fn subscriptions_count(&self, message_type: Ustr) -> usize {
        self.matching_subscriptions(message_type).len()
    }

    /// Returns the message types with direct subscriptions.
    #[must_use]
    pub fn topics(&self) -> Vec<Ustr> {
        self.direct.iter().map(|entry| *entry.key()).collect()
    }

    /// Registers a one-shot correlation waiter for `correlation_id`.
    ///
    /// The waiter completes with the first matching response payload, or with
    /// [`BusError::RequestTimedOut`] once `timeout` has elapsed.
    pub(crate) fn register_waiter(
        &self,
        correlation_id: UUID4,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<DecodedPayload, BusError>> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(
            correlation_id,
            CorrelationWaiter {
                deadline: Instant::now() + timeout,
                timeout,
                sender,
            },
        );
        receiver
    }

    /// Removes the waiter for `correlation_id`, if still pending.
    pub(crate) fn remove_waiter(&self, correlation_id: UUID4) {
        self.waiters.remove(&correlation_id);
    }

    /// Returns the count of pending correlation waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Completes every waiter whose deadline is past with
    /// [`BusError::RequestTimedOut`], returning how many were expired.
    pub fn cleanup_expired_waiters(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<UUID4> = self
            .waiters
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for correlation_id in expired {
            if let Some((_, waiter)) = self.waiters.remove(&correlation_id) {
                let _ = waiter.sender.send(Err(BusError::RequestTimedOut {
                    timeout: waiter.timeout,
                }));
                count += 1;
            }
        }
        count
    }

    /// Dispatches `envelope` to every covering subscriber and completes any
    /// matching correlation waiter.
    ///
    /// A panicking handler is logged and isolated; remaining handlers still
    /// receive the message.
    pub fn dispatch(&self, envelope: &MessageEnvelope, payload: &DecodedPayload) {
        for sub in self.matching_subscriptions(envelope.message_type) {
            let result = catch_unwind(AssertUnwindSafe(|| {
                sub.handler.0.handle(&**payload, envelope);
            }));
            if result.is_err() {
                log::error!(
                    "Handler '{}' panicked handling '{}'",
                    sub.handler_id,
                    envelope.message_type
                );
            }
        }

        if let Some(correlation_id) = envelope.correlation_id {
            if let Some((_, waiter)) = self.waiters.remove(&correlation_id) {
                let _ = waiter.sender.send(Ok(payload.clone()));
            }
        }
    }

    /// Removes every subscription and completes every pending waiter with
    /// [`BusError::RequestTimedOut`].
    pub fn clear(&self) {
        self.direct.clear();
        self.patterns.clear();

        let pending: Vec<UUID4> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for correlation_id in pending {
            if let Some((_, waiter)) = self.waiters.remove(&correlation_id) {
                let _ = waiter.sender.send(Err(BusError::RequestTimedOut {
                    timeout: waiter.timeout,
                }));
            }
        }
    }
}
