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

//! Cooperative cooldown registry guarding request admission.
//!
//! Cooldown slots throttle player-initiated commands and gate one-shot
//! operations (dialogue sessions, `/play`, and similar). Slots are keyed by
//! [`CooldownKey`] and governed by a [`CooldownSpec`] describing the window
//! and the contention policy.

pub mod registry;

use std::{
    fmt::{Debug, Display, Formatter},
    time::{Duration, Instant},
};

use fulcrum_core::correctness::{FAILED, check_positive_duration, check_valid_string};
use strum::Display as StrumDisplay;
use ustr::Ustr;
use uuid::Uuid;

pub use self::registry::CooldownRegistry;

/// Identifies one throttle slot.
///
/// Namespace and name are stored trimmed; the subject is the 128-bit identity
/// the slot throttles (typically a player), with an optional context
/// discriminator (e.g. an NPC or arena id). Equality is structural over all
/// four fields.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CooldownKey {
    /// The owning subsystem, e.g. "npc" or "command".
    pub namespace: Ustr,
    /// The throttled operation within the namespace.
    pub name: Ustr,
    /// The identity the slot applies to.
    pub subject_id: Uuid,
    /// Optional discriminator scoping the slot within the operation.
    pub context_id: Option<Ustr>,
}

impl CooldownKey {
    /// Creates a new [`CooldownKey`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `namespace` or `name` is blank after trimming, or
    /// if `context_id` is Some and blank.
    pub fn new_checked<T: AsRef<str>>(
        namespace: T,
        name: T,
        subject_id: Uuid,
        context_id: Option<T>,
    ) -> anyhow::Result<Self> {
        let namespace = namespace.as_ref().trim();
        let name = name.as_ref().trim();
        check_valid_string(namespace, stringify!(namespace))?;
        check_valid_string(name, stringify!(name))?;
        let context_id = match context_id {
            Some(context) => {
                let context = context.as_ref().trim();
                check_valid_string(context, stringify!(context_id))?;
                Some(Ustr::from(context))
            }
            None => None,
        };

        Ok(Self {
            namespace: Ustr::from(namespace),
            name: Ustr::from(name),
            subject_id,
            context_id,
        })
    }

    /// Creates a new [`CooldownKey`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `namespace` or `name` is blank after trimming.
    pub fn new<T: AsRef<str>>(
        namespace: T,
        name: T,
        subject_id: Uuid,
        context_id: Option<T>,
    ) -> Self {
        Self::new_checked(namespace, name, subject_id, context_id).expect(FAILED)
    }
}

impl Debug for CooldownKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}('{self}')", stringify!(CooldownKey))
    }
}

impl Display for CooldownKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.name, self.subject_id)?;
        if let Some(context_id) = self.context_id {
            write!(f, ":{context_id}")?;
        }
        Ok(())
    }
}

/// Decision rule when acquiring a slot that is already active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, StrumDisplay)]
pub enum CooldownPolicy {
    /// Keep the existing expiry and reject the acquire.
    RejectWhileActive,
    /// Move the expiry forward to now + window and accept.
    ExtendOnAcquire,
}

/// Describes a throttle window and its contention policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownSpec {
    /// The throttle window. Strictly positive.
    pub window: Duration,
    /// The decision rule while the slot is active.
    pub policy: CooldownPolicy,
}

impl CooldownSpec {
    /// Creates a new [`CooldownSpec`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `window` is zero.
    pub fn new_checked(window: Duration, policy: CooldownPolicy) -> anyhow::Result<Self> {
        check_positive_duration(window, stringify!(window))?;
        Ok(Self { window, policy })
    }

    /// Creates a new [`CooldownSpec`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    #[must_use]
    pub fn new(window: Duration, policy: CooldownPolicy) -> Self {
        Self::new_checked(window, policy).expect(FAILED)
    }

    /// A spec rejecting acquires while the slot is active.
    #[must_use]
    pub fn reject_while_active(window: Duration) -> Self {
        Self::new(window, CooldownPolicy::RejectWhileActive)
    }

    /// A spec refreshing the expiry on every acquire.
    #[must_use]
    pub fn extend_on_acquire(window: Duration) -> Self {
        Self::new(window, CooldownPolicy::ExtendOnAcquire)
    }
}

/// Proof of an accepted acquire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CooldownTicket {
    /// The canonical key the slot was reserved under.
    pub key: CooldownKey,
    /// When the reservation expires.
    pub expires_at: Instant,
}

/// The outcome of an acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquisition {
    /// The slot was idle (or extendable) and is now reserved.
    Accepted(CooldownTicket),
    /// The slot is active; `remaining` is the time until it frees.
    Rejected { remaining: Duration },
}

impl Acquisition {
    /// Returns whether the acquire was accepted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}
