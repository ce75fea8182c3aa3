// src/fan_out.rs

use crate::balance_cache::{Resolution, ResolveSource};
use crate::errors::UpstreamError;
use crate::metrics;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Default ceiling on concurrent upstream lookups per batch.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedResolution {
    pub key: String,
    pub resolution: Resolution,
}

/// Runs one computation per key with a concurrency ceiling and gathers every
/// outcome, sorted by key.
///
/// A failing or panicking key never affects the others, and the coordinator
/// always waits for every key instead of bailing out on the first error.
#[derive(Debug, Clone)]
pub struct FanOut {
    max_concurrency: usize,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl FanOut {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Duplicate keys are collapsed. When `deadline` passes, keys still
    /// waiting for a slot or still computing resolve to
    /// [`UpstreamError::DeadlineExceeded`]; finished keys keep their result.
    pub async fn execute<I, F, Fut>(
        &self,
        keys: I,
        deadline: Option<Instant>,
        compute: F,
    ) -> Vec<KeyedResolution>
    where
        I: IntoIterator<Item = String>,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resolution> + Send + 'static,
    {
        let keys: BTreeSet<String> = keys.into_iter().collect();
        let compute = Arc::new(compute);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        debug!(
            "FanOut: scheduling {} keys with concurrency {}",
            keys.len(),
            self.max_concurrency
        );

        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let compute = compute.clone();
            let semaphore = semaphore.clone();
            let task_key = key.clone();

            let task = tokio::spawn(async move {
                let work = async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    compute(task_key).await
                };
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, work)
                        .await
                        .unwrap_or_else(|_| unresolved(UpstreamError::DeadlineExceeded)),
                    None => work.await,
                }
            });
            tasks.push((key, task));
        }

        let mut results = Vec::with_capacity(tasks.len());
        let mut abandoned = 0u64;
        for (key, task) in tasks {
            let resolution = match task.await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!("FanOut: lookup task for {} failed: {}", key, e);
                    unresolved(UpstreamError::TaskFailed(e.to_string()))
                }
            };
            if resolution.outcome == Err(UpstreamError::DeadlineExceeded) {
                abandoned += 1;
            }
            results.push(KeyedResolution { key, resolution });
        }

        if abandoned > 0 {
            warn!("FanOut: {} keys abandoned at the request deadline", abandoned);
            metrics::increment_deadline_exceeded(abandoned);
        }

        results
    }
}

fn unresolved(error: UpstreamError) -> Resolution {
    Resolution {
        outcome: Err(error),
        source: ResolveSource::Unresolved,
    }
}
