//! Per-client fixed-window request admission.
//!
//! Every inbound request is checked against the window of its client identity
//! before any handler runs. State lives in memory only and is owned by a single
//! [`AdmissionController`] built at startup and shared through the app state.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

/// Upper bound on tracked identities before the oldest window is evicted.
pub const MAX_TRACKED_CLIENTS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Windows keyed by identity, plus the order in which they started.
///
/// `starts` may hold records for windows that have since rolled over or been
/// removed. A record is live only while it matches the map entry.
#[derive(Debug, Default)]
struct Windows {
    by_identity: HashMap<String, Window>,
    starts: VecDeque<(Instant, String)>,
}

impl Windows {
    fn is_live(&self, started_at: Instant, identity: &str) -> bool {
        self.by_identity
            .get(identity)
            .is_some_and(|window| window.started_at == started_at)
    }

    /// Drops the window that started first. Amortized O(1).
    fn evict_oldest(&mut self) {
        while let Some((started_at, identity)) = self.starts.pop_front() {
            if self.is_live(started_at, &identity) {
                self.by_identity.remove(&identity);
                return;
            }
        }
    }

    fn prune_expired(&mut self, length: Duration, now: Instant) -> usize {
        let before = self.by_identity.len();
        self.by_identity
            .retain(|_, window| now.saturating_duration_since(window.started_at) < length);

        let mut starts = std::mem::take(&mut self.starts);
        starts.retain(|(started_at, identity)| self.is_live(*started_at, identity));
        self.starts = starts;

        before - self.by_identity.len()
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    limit: u32,
    window: Duration,
    max_clients: usize,
    windows: Mutex<Windows>,
}

impl AdmissionController {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_capacity_limit(limit, window, MAX_TRACKED_CLIENTS)
    }

    pub fn with_capacity_limit(limit: u32, window: Duration, max_clients: usize) -> Self {
        Self {
            limit,
            window,
            max_clients: max_clients.max(1),
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    /// Counts one request for `identity` at `now`.
    ///
    /// The read-modify-write happens under a single lock so concurrent
    /// requests from the same identity can never exceed the limit.
    pub fn admit_at(&self, identity: &str, now: Instant) -> Admission {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let known = windows.by_identity.contains_key(identity);
        if !known && windows.by_identity.len() >= self.max_clients {
            windows.evict_oldest();
        }

        let Windows {
            by_identity,
            starts,
        } = &mut *windows;
        let window = by_identity.entry(identity.to_string()).or_insert_with(|| {
            starts.push_back((now, identity.to_string()));
            Window {
                started_at: now,
                count: 0,
            }
        });

        if now.saturating_duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
            starts.push_back((now, identity.to_string()));
        }

        if window.count >= self.limit {
            let elapsed = now.saturating_duration_since(window.started_at);
            return Admission::Denied {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }

        window.count += 1;
        Admission::Allowed {
            remaining: self.limit - window.count,
        }
    }

    /// Drops every identity whose window has elapsed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = windows.prune_expired(self.window, now);
        if removed > 0 {
            debug!(
                removed,
                remaining = windows.by_identity.len(),
                "pruned expired rate-limit windows"
            );
        }
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_identity
            .len()
    }
}
