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

//! Concurrent cooldown slot store with aliasing and a background reaper.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use fulcrum_core::correctness::check_predicate_true;
use tokio::{sync::Notify, task::JoinHandle};

use super::{Acquisition, CooldownKey, CooldownPolicy, CooldownSpec, CooldownTicket};
use crate::{
    logging::{log_task_awaiting, log_task_started, log_task_stopped},
    runtime::get_runtime,
};

const REAPER: &str = "cooldown-reaper";
const PAUSE_POLL: Duration = Duration::from_millis(5);
const IDLE_POLL: Duration = Duration::from_millis(500);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
struct CooldownEntry {
    expires_at: Instant,
    stamp: u64,
}

impl CooldownEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// An expiry scheduled for the reaper. Carries the generation stamp of the
/// entry it was enqueued for, so a stale event cannot evict a fresher entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryEvent {
    due: Instant,
    stamp: u64,
    key: CooldownKey,
}

/// Grants, queries, clears, and expires cooldown slots keyed by [`CooldownKey`].
///
/// Two keys can be made to share a slot via [`CooldownRegistry::link`]; every
/// operation canonicalises its key through the alias union-find first. Expired
/// entries are removed by a dedicated reaper task; [`CooldownRegistry::close`]
/// stops it and clears all state.
pub struct CooldownRegistry {
    entries: Arc<DashMap<CooldownKey, CooldownEntry>>,
    aliases: Mutex<HashMap<CooldownKey, CooldownKey>>,
    queue: Arc<Mutex<BinaryHeap<Reverse<ExpiryEvent>>>>,
    notify: Arc<Notify>,
    stamp: AtomicU64,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for CooldownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(CooldownRegistry))
            .field("tracked", &self.entries.len())
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownRegistry {
    /// Creates a new [`CooldownRegistry`] instance and starts its reaper task.
    #[must_use]
    pub fn new() -> Self {
        let entries = Arc::new(DashMap::new());
        let queue = Arc::new(Mutex::new(BinaryHeap::new()));
        let notify = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let reaper_handle = get_runtime().spawn(run_reaper(
            entries.clone(),
            queue.clone(),
            notify.clone(),
            paused.clone(),
            closed.clone(),
        ));

        Self {
            entries,
            aliases: Mutex::new(HashMap::new()),
            queue,
            notify,
            stamp: AtomicU64::new(0),
            paused,
            closed,
            reaper_handle: Mutex::new(Some(reaper_handle)),
        }
    }

    /// Attempts to reserve the slot for `key` under `spec`.
    ///
    /// An idle or expired slot is reserved for `spec.window`. An active slot
    /// is refreshed under [`CooldownPolicy::ExtendOnAcquire`], or rejected
    /// with the remaining window under [`CooldownPolicy::RejectWhileActive`].
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is closed.
    pub async fn acquire(
        &self,
        key: &CooldownKey,
        spec: &CooldownSpec,
    ) -> anyhow::Result<Acquisition> {
        check_predicate_true(
            !self.closed.load(Ordering::Relaxed),
            "cooldown registry closed",
        )?;
        let key = self.canonical(key);
        let now = Instant::now();

        // Per-key atomic compute under the entry guard
        let entry = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if current.is_expired(now) || spec.policy == CooldownPolicy::ExtendOnAcquire {
                    let entry = self.next_entry(now, spec);
                    occupied.insert(entry);
                    entry
                } else {
                    return Ok(Acquisition::Rejected {
                        remaining: current.expires_at - now,
                    });
                }
            }
            Entry::Vacant(vacant) => {
                let entry = self.next_entry(now, spec);
                vacant.insert(entry);
                entry
            }
        };

        // Guard dropped; schedule the expiry
        self.enqueue_expiry(key, entry);
        Ok(Acquisition::Accepted(CooldownTicket {
            key,
            expires_at: entry.expires_at,
        }))
    }

    /// Returns the positive remainder of the canonical slot for `key`, or
    /// `None` when idle or expired.
    #[must_use]
    pub fn remaining(&self, key: &CooldownKey) -> Option<Duration> {
        let key = self.canonical(key);
        let now = Instant::now();
        self.entries
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Deletes the canonical slot for `key`; no effect if absent.
    pub async fn clear(&self, key: &CooldownKey) {
        let key = self.canonical(key);
        self.entries.remove(&key);
    }

    /// Unions each alias's root into `primary`'s root so they share a slot.
    ///
    /// An alias carrying an active entry is merged into the primary, keeping
    /// the later expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is closed.
    pub async fn link(
        &self,
        primary: &CooldownKey,
        aliases: &[CooldownKey],
    ) -> anyhow::Result<()> {
        check_predicate_true(
            !self.closed.load(Ordering::Relaxed),
            "cooldown registry closed",
        )?;

        let mut migrated = Vec::new();
        let primary_root = {
            let mut parents = self.aliases.lock().unwrap();
            let primary_root = find_root(&mut parents, primary);

            for alias in aliases {
                let alias_root = find_root(&mut parents, alias);
                if alias_root == primary_root {
                    continue;
                }
                parents.insert(alias_root, primary_root);
                parents.insert(primary_root, primary_root);

                if let Some((_, moved)) = self.entries.remove(&alias_root) {
                    let survivor = match self.entries.entry(primary_root) {
                        Entry::Occupied(mut occupied) => {
                            if occupied.get().expires_at < moved.expires_at {
                                occupied.insert(moved);
                                moved
                            } else {
                                *occupied.get()
                            }
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(moved);
                            moved
                        }
                    };
                    migrated.push(survivor);
                }
            }
            primary_root
        };

        // The migrated entry's old expiry event now points at a removed key;
        // schedule a fresh one under the primary root
        for entry in migrated {
            self.enqueue_expiry(primary_root, entry);
        }
        Ok(())
    }

    /// Synchronously sweeps up to `max_batch` due expiries, returning how many
    /// entries were removed.
    pub fn drain_once(&self, max_batch: usize) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        while removed < max_batch {
            let event = {
                let mut queue = self.queue.lock().unwrap();
                if queue.peek().is_some_and(|r| r.0.due <= now) {
                    queue.pop().map(|r| r.0)
                } else {
                    None
                }
            };
            let Some(event) = event else { break };

            if self
                .entries
                .remove_if(&event.key, |_, entry| entry.stamp == event.stamp)
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    /// Returns the count of tracked entries (including not-yet-reaped expired ones).
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Pauses the reaper; due expiries accumulate until resumed.
    pub fn pause_reaper(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resumes the reaper.
    pub fn resume_reaper(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Stops the reaper and clears all state. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let handle = self.reaper_handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            log_task_awaiting(REAPER);
            match tokio::time::timeout(CLOSE_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Error awaiting task '{REAPER}': {e:?}"),
                Err(_) => {
                    log::error!("Timeout {CLOSE_GRACE:?} awaiting task '{REAPER}', aborting");
                    handle.abort();
                }
            }
        }

        self.entries.clear();
        self.queue.lock().unwrap().clear();
        self.aliases.lock().unwrap().clear();
    }

    fn next_entry(&self, now: Instant, spec: &CooldownSpec) -> CooldownEntry {
        CooldownEntry {
            expires_at: now + spec.window,
            stamp: self.stamp.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    fn enqueue_expiry(&self, key: CooldownKey, entry: CooldownEntry) {
        self.queue.lock().unwrap().push(Reverse(ExpiryEvent {
            due: entry.expires_at,
            stamp: entry.stamp,
            key,
        }));
        self.notify.notify_one();
    }

    fn canonical(&self, key: &CooldownKey) -> CooldownKey {
        let mut parents = self.aliases.lock().unwrap();
        find_root(&mut parents, key)
    }
}

/// Walks the alias forest to the root of `key`, compressing the path.
fn find_root(parents: &mut HashMap<CooldownKey, CooldownKey>, key: &CooldownKey) -> CooldownKey {
    let mut root = *key;
    while let Some(parent) = parents.get(&root) {
        if *parent == root {
            break;
        }
        root = *parent;
    }

    let mut current = *key;
    while current != root {
        let parent = parents[&current];
        parents.insert(current, root);
        current = parent;
    }
    root
}

async fn run_reaper(
    entries: Arc<DashMap<CooldownKey, CooldownEntry>>,
    queue: Arc<Mutex<BinaryHeap<Reverse<ExpiryEvent>>>>,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    log_task_started(REAPER);

    loop {
        if closed.load(Ordering::Relaxed) {
            break;
        }
        if paused.load(Ordering::Relaxed) {
            tokio::time::sleep(PAUSE_POLL).await;
            continue;
        }

        let next_due = { queue.lock().unwrap().peek().map(|r| r.0.due) };
        match next_due {
            None => {
                tokio::select! {
                    () = notify.notified() => {}
                    () = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Some(due) => {
                let now = Instant::now();
                if due <= now {
                    let event = { queue.lock().unwrap().pop().map(|r| r.0) };
                    if let Some(event) = event {
                        if event.due <= now {
                            // A stale stamp means the entry was refreshed since
                            // this expiry was scheduled; leave it alone
                            entries.remove_if(&event.key, |_, entry| entry.stamp == event.stamp);
                        } else {
                            queue.lock().unwrap().push(Reverse(event));
                        }
                    }
                } else {
                    tokio::select! {
                        () = notify.notified() => {}
                        () = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                    }
                }
            }
        }
    }

    log_task_stopped(REAPER);
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use uuid::Uuid;

    use super::*;
    use crate::testing::wait_until_async;

    const WAIT: Duration = Duration::from_secs(2);

    fn stub_key(name: &str) -> CooldownKey {
        CooldownKey::new("command", name, Uuid::nil(), None)
    }

    #[rstest]
    fn test_find_root_compresses_paths() {
        let mut parents = HashMap::new();
        let a = stub_key("a");
        let b = stub_key("b");
        let c = stub_key("c");
        parents.insert(a, b);
        parents.insert(b, c);

        assert_eq!(find_root(&mut parents, &a), c);
        // Compressed: a now points directly at the root
        assert_eq!(parents[&a], c);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acquire_then_reject_while_active() {
        let registry = CooldownRegistry::new();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_secs(1));

        let first = registry.acquire(&key, &spec).await.unwrap();
        let Acquisition::Accepted(ticket) = first else {
            panic!("first acquire should be accepted");
        };
        assert_eq!(ticket.key, key);

        let second = registry.acquire(&key, &spec).await.unwrap();
        let Acquisition::Rejected { remaining } = second else {
            panic!("second acquire should be rejected");
        };
        assert!(remaining > Duration::from_millis(900));
        assert!(remaining <= Duration::from_secs(1));

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expired_slot_is_reacquirable() {
        let registry = CooldownRegistry::new();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_millis(50));

        assert!(registry.acquire(&key, &spec).await.unwrap().is_accepted());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.acquire(&key, &spec).await.unwrap().is_accepted());

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_extend_on_acquire_refreshes_expiry() {
        let registry = CooldownRegistry::new();
        let key = stub_key("dialogue");
        let spec = CooldownSpec::extend_on_acquire(Duration::from_millis(500));

        assert!(registry.acquire(&key, &spec).await.unwrap().is_accepted());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = registry.acquire(&key, &spec).await.unwrap();
        let Acquisition::Accepted(ticket) = second else {
            panic!("extend policy should always accept");
        };
        // Refreshed to a full window from the second acquire
        assert!(ticket.expires_at > Instant::now() + Duration::from_millis(400));

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remaining_and_clear() {
        let registry = CooldownRegistry::new();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_secs(5));

        assert_eq!(registry.remaining(&key), None);
        registry.acquire(&key, &spec).await.unwrap();

        let remaining = registry.remaining(&key).unwrap();
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_secs(5));

        registry.clear(&key).await;
        assert_eq!(registry.remaining(&key), None);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reaper_removes_expired_entries() {
        let registry = CooldownRegistry::new();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_millis(50));

        registry.acquire(&key, &spec).await.unwrap();
        assert_eq!(registry.tracked_count(), 1);
        // Never removed before its expiry
        assert!(registry.remaining(&key).is_some());

        wait_until_async(|| async { registry.tracked_count() == 0 }, WAIT).await;

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_expiry_does_not_evict_fresh_entry() {
        let registry = CooldownRegistry::new();
        registry.pause_reaper();
        let key = stub_key("dialogue");
        let spec = CooldownSpec::extend_on_acquire(Duration::from_millis(300));

        registry.acquire(&key, &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.acquire(&key, &spec).await.unwrap(); // refresh, stamp increments

        // Past the first expiry but not the refreshed one
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(registry.drain_once(10), 0);
        assert_eq!(registry.tracked_count(), 1);

        // Past the refreshed expiry
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.drain_once(10), 1);
        assert_eq!(registry.tracked_count(), 0);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_once_respects_batch_size() {
        let registry = CooldownRegistry::new();
        registry.pause_reaper();
        let spec = CooldownSpec::reject_while_active(Duration::from_millis(10));

        for i in 0..3 {
            let key = stub_key(&format!("slot-{i}"));
            registry.acquire(&key, &spec).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.drain_once(2), 2);
        assert_eq!(registry.tracked_count(), 1);
        assert_eq!(registry.drain_once(2), 1);
        assert_eq!(registry.tracked_count(), 0);
        assert_eq!(registry.drain_once(2), 0);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_and_resume_reaper() {
        let registry = CooldownRegistry::new();
        registry.pause_reaper();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_millis(30));

        registry.acquire(&key, &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.tracked_count(), 1);

        registry.resume_reaper();
        wait_until_async(|| async { registry.tracked_count() == 0 }, WAIT).await;

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_linked_alias_shares_slot() {
        let registry = CooldownRegistry::new();
        let primary = stub_key("npc-door");
        let alias = stub_key("npc-window");
        registry.link(&primary, &[alias]).await.unwrap();

        let spec = CooldownSpec::extend_on_acquire(Duration::from_millis(500));
        assert!(registry.acquire(&alias, &spec).await.unwrap().is_accepted());

        let remaining = registry.remaining(&primary).unwrap();
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_millis(500));

        registry.clear(&primary).await;
        assert_eq!(registry.remaining(&alias), None);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_link_merges_later_expiry() {
        let registry = CooldownRegistry::new();
        let primary = stub_key("door");
        let alias = stub_key("window");

        registry
            .acquire(
                &primary,
                &CooldownSpec::reject_while_active(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        registry
            .acquire(
                &alias,
                &CooldownSpec::reject_while_active(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        registry.link(&primary, &[alias]).await.unwrap();

        // The alias carried the later expiry; the merged slot keeps it
        let remaining = registry.remaining(&primary).unwrap();
        assert!(remaining > Duration::from_secs(1));
        assert_eq!(registry.tracked_count(), 1);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_link_same_root_is_a_no_op() {
        let registry = CooldownRegistry::new();
        let primary = stub_key("door");
        let alias = stub_key("window");

        registry.link(&primary, &[alias]).await.unwrap();
        registry.link(&primary, &[alias]).await.unwrap();
        registry.link(&alias, &[primary]).await.unwrap();

        let spec = CooldownSpec::reject_while_active(Duration::from_secs(1));
        registry.acquire(&alias, &spec).await.unwrap();
        assert_eq!(registry.tracked_count(), 1);

        registry.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_idempotent_and_clears_state() {
        let registry = CooldownRegistry::new();
        let key = stub_key("play");
        let spec = CooldownSpec::reject_while_active(Duration::from_secs(5));

        registry.acquire(&key, &spec).await.unwrap();
        registry.close().await;
        registry.close().await;

        assert_eq!(registry.tracked_count(), 0);
        assert!(registry.acquire(&key, &spec).await.is_err());
    }
}
