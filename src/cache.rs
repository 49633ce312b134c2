//! Bounded, time-limited memory of resolved groups.
//!
//! Entries expire a fixed time after they were written and the least
//! recently used entry is evicted when the cache is full. For a given user
//! only one resolution runs at a time: callers arriving while it is in
//! flight wait for it and receive the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::group::Groups;
use crate::telemetry::{CACHE_EVICTIONS, CACHE_REQUESTS};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FAILURE_TTL: Duration = Duration::ZERO;
pub const DEFAULT_CAPACITY: usize = 1000;

/// Result of a lookup, shared by every caller of an in-flight resolution.
pub type Outcome = std::result::Result<Groups, Arc<Error>>;

type Cell = Arc<OnceCell<Outcome>>;

/// Running resolution of one user and the number of callers attached to it.
struct Flight {
    cell: Cell,
    callers: usize,
}

/// Cache limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Freshness window of a resolved entry.
    pub ttl: Duration,
    /// Freshness window of an entry written after a failed resolution.
    /// Zero keeps failures out of the cache.
    pub failure_ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    groups: Groups,
    expires_at: Instant,
    /// Written after a failure, holds no real answer.
    degraded: bool,
}

struct State {
    entries: LruCache<String, CacheEntry>,
    in_flight: HashMap<String, Flight>,
}

impl State {
    /// Fresh entry of `user`, dropping it when expired.
    fn fresh(&mut self, user: &str, now: Instant) -> Option<CacheEntry> {
        let expired = match self.entries.get(user) {
            Some(entry) if entry.expires_at > now => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.pop(user);
        }
        None
    }
}

/// Detaches a caller from its flight, dropping the flight once nobody is
/// left to drive it.
struct Caller<'a> {
    state: &'a Mutex<State>,
    user: &'a str,
    cell: &'a Cell,
}

impl Drop for Caller<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let idle = match state.in_flight.get_mut(self.user) {
            Some(flight) if Arc::ptr_eq(&flight.cell, self.cell) => {
                flight.callers = flight.callers.saturating_sub(1);
                flight.callers == 0
            },
            _ => false,
        };

        if idle {
            tracing::trace!(user = self.user, "releasing abandoned resolution");
            state.in_flight.remove(self.user);
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Per-user cache of group sets with single-flight loading.
pub struct GroupCache {
    state: Mutex<State>,
    settings: CacheSettings,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl GroupCache {
    /// Create a new [`GroupCache`].
    pub fn new(settings: CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Get groups of `user`, running `resolve` on a miss.
    ///
    /// When a resolution for `user` is already running, `resolve` is not
    /// called and the running one's outcome is returned. Should the caller
    /// driving a resolution be cancelled, a waiting caller takes over.
    pub async fn get_or_resolve<F, Fut>(&self, user: &str, resolve: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Groups>>,
    {
        let cell = {
            let mut state = self.state.lock();

            if let Some(entry) = state.fresh(user, Instant::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(CACHE_REQUESTS, "result" => "hit").increment(1);
                if entry.degraded {
                    tracing::debug!(user, "serving entry written after a failure");
                }
                return Ok(entry.groups);
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(CACHE_REQUESTS, "result" => "miss").increment(1);
            let flight = state
                .in_flight
                .entry(user.to_owned())
                .or_insert_with(|| Flight {
                    cell: Cell::default(),
                    callers: 0,
                });
            flight.callers += 1;
            Arc::clone(&flight.cell)
        };

        let _caller = Caller {
            state: &self.state,
            user,
            cell: &cell,
        };
        let current = &cell;
        cell
            .get_or_init(|| async move {
                let outcome = resolve().await.map_err(Arc::new);
                self.complete(user, current, &outcome);
                outcome
            })
            .await
            .clone()
    }

    /// Record the outcome of the resolution driven through `cell`.
    fn complete(&self, user: &str, cell: &Cell, outcome: &Outcome) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state
            .in_flight
            .get(user)
            .is_some_and(|running| Arc::ptr_eq(&running.cell, cell))
        {
            state.in_flight.remove(user);
        }

        let entry = match outcome {
            Ok(groups) => CacheEntry {
                groups: groups.clone(),
                expires_at: now + self.settings.ttl,
                degraded: false,
            },
            Err(_) if !self.settings.failure_ttl.is_zero() => CacheEntry {
                groups: Groups::new(),
                expires_at: now + self.settings.failure_ttl,
                degraded: true,
            },
            Err(_) => return,
        };

        if let Some((evicted, _)) = state.entries.push(user.to_owned(), entry) {
            if evicted != user {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(CACHE_EVICTIONS).increment(1);
                tracing::trace!(user = %evicted, "evicted least recently used entry");
            }
        }
    }

    /// Drop the entry of `user`.
    pub fn invalidate(&self, user: &str) {
        self.state.lock().entries.pop(user);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.state.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.state.lock().entries.len(),
        }
    }
}
