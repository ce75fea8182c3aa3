// src/balance_cache.rs
//
// TTL-bounded balance memo with per-key request coalescing.
// Expiry is checked lazily on read; nothing sweeps the map.

use crate::errors::UpstreamError;
use crate::metrics;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const CACHE_NAME: &str = "balance";

/// Result of one upstream balance lookup, in lamports.
pub type Outcome = Result<u64, UpstreamError>;

/// Where a resolved outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// A fresh cache entry.
    Cache,
    /// This caller ran the computation (leader).
    Computed,
    /// Another caller's in-flight computation (follower).
    Coalesced,
    /// No outcome was produced: the deadline passed or the task failed.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    pub source: ResolveSource,
}

impl Resolution {
    pub fn from_cache(&self) -> bool {
        self.source == ResolveSource::Cache
    }
}

/// Decides how long an outcome stays fresh.
///
/// Swapping the policy does not touch the coalescing logic.
pub trait ExpiryPolicy: Send + Sync {
    fn expires_at(&self, stored_at: Instant, outcome: &Outcome) -> Instant;
}

/// Fixed TTL, uniform for successes and failures unless `with_failure_ttl` says otherwise.
///
/// A cached failure is served as-is until it expires.
#[derive(Debug, Clone, Copy)]
pub struct FixedTtl {
    success: Duration,
    failure: Duration,
}

impl FixedTtl {
    pub fn new(ttl: Duration) -> Self {
        Self {
            success: ttl,
            failure: ttl,
        }
    }

    pub fn with_failure_ttl(mut self, failure: Duration) -> Self {
        self.failure = failure;
        self
    }

    pub fn success_ttl(&self) -> Duration {
        self.success
    }

    pub fn failure_ttl(&self) -> Duration {
        self.failure
    }
}

impl ExpiryPolicy for FixedTtl {
    fn expires_at(&self, stored_at: Instant, outcome: &Outcome) -> Instant {
        match outcome {
            Ok(_) => stored_at + self.success,
            Err(_) => stored_at + self.failure,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: Outcome,
    expires_at: Instant,
}

struct PendingFlight {
    generation: u64,
    rx: watch::Receiver<Option<Outcome>>,
}

enum Role<'a, P: ExpiryPolicy> {
    Leader(Flight<'a, P>),
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Leader-side handle of an in-flight computation.
///
/// Dropping it unregisters the flight. If it is dropped without `complete`
/// (leader abandoned on deadline) the sender closes and followers retry.
struct Flight<'a, P: ExpiryPolicy> {
    cache: &'a BalanceCache<P>,
    key: &'a str,
    generation: u64,
    tx: watch::Sender<Option<Outcome>>,
}

impl<P: ExpiryPolicy> Flight<'_, P> {
    fn complete(self, outcome: Outcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<P: ExpiryPolicy> Drop for Flight<'_, P> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.cache.in_flight);
        if in_flight
            .get(self.key)
            .map_or(false, |pending| pending.generation == self.generation)
        {
            in_flight.remove(self.key);
        }
    }
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub computations: u64,
    pub entries: usize,
}

/// Balance cache shared by every request of the process.
///
/// The entry map and the in-flight registry sit behind separate mutexes and
/// neither lock is held across an await or while the other is taken.
pub struct BalanceCache<P: ExpiryPolicy = FixedTtl> {
    entries: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, PendingFlight>>,
    next_generation: AtomicU64,
    policy: P,
    stats: CacheStats,
}

impl BalanceCache<FixedTtl> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_policy(FixedTtl::new(ttl))
    }
}

impl<P: ExpiryPolicy> BalanceCache<P> {
    pub fn with_policy(policy: P) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            policy,
            stats: CacheStats::default(),
        }
    }

    /// Fresh outcome for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<Outcome> {
        match self.peek(key) {
            Some(outcome) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_hit(CACHE_NAME);
                Some(outcome)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_miss(CACHE_NAME);
                None
            }
        }
    }

    /// Stores `outcome`, replacing whatever was there.
    pub fn set(&self, key: &str, outcome: Outcome) {
        let expires_at = self.policy.expires_at(Instant::now(), &outcome);
        let size = {
            let mut entries = lock(&self.entries);
            entries.insert(key.to_string(), CacheEntry { outcome, expires_at });
            entries.len()
        };
        metrics::set_cache_size(CACHE_NAME, size as f64);
    }

    /// Returns the cached outcome for `key`, or runs `compute` at most once
    /// across all concurrent callers and shares its outcome with them.
    pub async fn resolve<F, Fut>(&self, key: &str, compute: F) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let flight = loop {
            if let Some(outcome) = self.get(key) {
                return Resolution {
                    outcome,
                    source: ResolveSource::Cache,
                };
            }
            match self.join_or_lead(key) {
                Role::Leader(flight) => break flight,
                Role::Follower(rx) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_coalesced_wait(CACHE_NAME);
                    if let Some(outcome) = wait_for_leader(rx).await {
                        return Resolution {
                            outcome,
                            source: ResolveSource::Coalesced,
                        };
                    }
                    debug!("BalanceCache: leader for {} abandoned its flight, retrying", key);
                }
            }
        };

        // Another leader may have finished between our miss and registration.
        if let Some(outcome) = self.peek(key) {
            flight.complete(outcome.clone());
            return Resolution {
                outcome,
                source: ResolveSource::Cache,
            };
        }

        self.stats.computations.fetch_add(1, Ordering::Relaxed);
        let outcome = compute().await;
        self.set(key, outcome.clone());
        flight.complete(outcome.clone());
        Resolution {
            outcome,
            source: ResolveSource::Computed,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Number of keys with a computation currently outstanding.
    pub fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            computations: self.stats.computations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn peek(&self, key: &str) -> Option<Outcome> {
        let entries = lock(&self.entries);
        let entry = entries.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.outcome.clone())
        } else {
            None
        }
    }

    fn join_or_lead<'a>(&'a self, key: &'a str) -> Role<'a, P> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(pending) = in_flight.get(key) {
            return Role::Follower(pending.rx.clone());
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.to_string(), PendingFlight { generation, rx });
        Role::Leader(Flight {
            cache: self,
            key,
            generation,
            tx,
        })
    }
}

/// `None` when the leader went away without publishing an outcome.
async fn wait_for_leader(mut rx: watch::Receiver<Option<Outcome>>) -> Option<Outcome> {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(published) => (*published).clone(),
        Err(_) => None,
    };
    outcome
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_until_ttl_elapses() {
        let cache = BalanceCache::new(TTL);
        cache.set("wallet", Ok(42));

        assert_eq!(cache.get("wallet"), Some(Ok(42)));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("wallet"), Some(Ok(42)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("wallet"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_restarts_ttl() {
        let cache = BalanceCache::new(TTL);
        cache.set("wallet", Ok(1));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("wallet", Ok(2));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(cache.get("wallet"), Some(Ok(2)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_cached_and_not_recomputed() {
        let cache = BalanceCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let failure = UpstreamError::Transport("connection reset".into());

        let first = cache
            .resolve("wallet", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure.clone())
            })
            .await;
        assert_eq!(first.outcome, Err(failure.clone()));
        assert_eq!(first.source, ResolveSource::Computed);
        assert_eq!(cache.get("wallet"), Some(Err(failure.clone())));

        let second = cache
            .resolve("wallet", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(second.outcome, Err(failure));
        assert!(second.from_cache());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Once the TTL lapses the next request gets a fresh attempt.
        tokio::time::advance(TTL).await;
        let third = cache
            .resolve("wallet", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(third.outcome, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ttl_is_tunable() {
        let policy = FixedTtl::new(TTL).with_failure_ttl(Duration::from_secs(1));
        let cache = BalanceCache::with_policy(policy);
        cache.set("ok", Ok(5));
        cache.set("bad", Err(UpstreamError::Timeout(Duration::from_secs(8))));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("ok"), Some(Ok(5)));
        assert_eq!(cache.get("bad"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolve_computes_once() {
        let cache = Arc::new(BalanceCache::new(TTL));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .resolve("wallet", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(99)
                    })
                    .await
            }));
        }

        let mut sources = Vec::new();
        for handle in handles {
            let resolution = handle.await.unwrap();
            assert_eq!(resolution.outcome, Ok(99));
            sources.push(resolution.source);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sources.iter().filter(|s| **s == ResolveSource::Computed).count(),
            1
        );
        assert_eq!(cache.in_flight_len(), 0);
        assert_eq!(cache.stats().computations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leader_hands_over_to_follower() {
        let cache = Arc::new(BalanceCache::new(TTL));
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .resolve("wallet", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.in_flight_len(), 1);

        let follower = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .resolve("wallet", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(2)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let resolution = follower.await.unwrap();

        assert_eq!(resolution.outcome, Ok(2));
        assert_eq!(resolution.source, ResolveSource::Computed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.in_flight_len(), 0);
    }

    #[test]
    fn test_get_on_empty_cache_is_a_miss() {
        let cache = BalanceCache::new(TTL);
        assert_eq!(cache.get("nobody"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }
}
