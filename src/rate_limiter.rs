// src/rate_limiter.rs
//
// Per-client token bucket with a windowed burst reset: every token comes back
// at once when `per` has elapsed since the window opened. Nothing trickles in
// between, so a full burst is admitted right after each reset.

use crate::metrics;
use log::debug;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    pub tokens: u32,
    pub window_start: Instant,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Storage for per-client buckets.
///
/// `update` must run the closure and store its bucket atomically with respect
/// to other updates of the same client.
pub trait BucketStore: Send + Sync {
    fn update(
        &self,
        client_id: &str,
        decide: &mut dyn FnMut(Option<TokenBucket>) -> (TokenBucket, Admission),
    ) -> Admission;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime bucket map. Buckets are never evicted, so the map grows
/// with the number of distinct clients seen.
#[derive(Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl BucketStore for InMemoryBucketStore {
    fn update(
        &self,
        client_id: &str,
        decide: &mut dyn FnMut(Option<TokenBucket>) -> (TokenBucket, Admission),
    ) -> Admission {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let (bucket, admission) = decide(buckets.get(client_id).copied());
        match buckets.get_mut(client_id) {
            Some(existing) => *existing = bucket,
            None => {
                buckets.insert(client_id.to_string(), bucket);
            }
        }
        admission
    }

    fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct RateLimiter<S: BucketStore = InMemoryBucketStore> {
    limit: u32,
    per: Duration,
    store: S,
}

impl RateLimiter<InMemoryBucketStore> {
    pub fn new(limit: NonZeroU32, per: Duration) -> Self {
        Self::with_store(limit, per, InMemoryBucketStore::default())
    }
}

impl<S: BucketStore> RateLimiter<S> {
    pub fn with_store(limit: NonZeroU32, per: Duration, store: S) -> Self {
        Self {
            limit: limit.get(),
            per,
            store,
        }
    }

    /// Admits or rejects one unit of work for `client_id`.
    pub fn allow(&self, client_id: &str) -> bool {
        self.check(client_id).is_allowed()
    }

    /// Like [`allow`](Self::allow) but also reports remaining tokens or the
    /// time until the window resets.
    pub fn check(&self, client_id: &str) -> Admission {
        let now = Instant::now();
        let admission = self
            .store
            .update(client_id, &mut |bucket| self.decide(bucket, now));
        if let Admission::Denied { retry_after } = admission {
            debug!(
                "RateLimiter: rejected {} (window resets in {:?})",
                client_id, retry_after
            );
            metrics::increment_rate_limited();
        }
        admission
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    pub fn tracked_clients(&self) -> usize {
        self.store.len()
    }

    fn decide(&self, bucket: Option<TokenBucket>, now: Instant) -> (TokenBucket, Admission) {
        let fresh = TokenBucket {
            tokens: self.limit - 1,
            window_start: now,
        };
        let Some(mut bucket) = bucket else {
            return (fresh, Admission::Allowed { remaining: fresh.tokens });
        };

        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed >= self.per {
            return (fresh, Admission::Allowed { remaining: fresh.tokens });
        }
        if bucket.tokens == 0 {
            let retry_after = self.per - elapsed;
            return (bucket, Admission::Denied { retry_after });
        }
        bucket.tokens -= 1;
        (bucket, Admission::Allowed { remaining: bucket.tokens })
    }
}
