// src/balance_service.rs

use crate::balance_cache::BalanceCache;
use crate::errors::BalanceError;
use crate::fan_out::FanOut;
use crate::key_validator::{KeyValidator, SolanaAddressValidator};
use crate::metrics;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::settings::Settings;
use crate::upstream::BalanceSource;
use anyhow::Context;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default upper bound on wallets per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 2000;

/// Balance of one requested wallet. A failed lookup reports `0` plus the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupResult {
    #[serde(rename = "wallet")]
    pub key: String,
    #[serde(rename = "balance_lamports")]
    pub value: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    pub results: Vec<LookupResult>,
    /// Advisory: at least one result came straight from the cache.
    pub cached_any: bool,
}

/// Batch balance lookups: admission, batch shape checks, dedup, then a
/// bounded fan-out where every key goes through the coalescing cache.
pub struct BalanceService {
    cache: Arc<BalanceCache>,
    limiter: Arc<RateLimiter>,
    source: Arc<dyn BalanceSource>,
    validator: Arc<dyn KeyValidator>,
    fan_out: FanOut,
    max_batch_size: usize,
    request_timeout: Option<Duration>,
}

impl BalanceService {
    pub fn new(
        cache: Arc<BalanceCache>,
        limiter: Arc<RateLimiter>,
        source: Arc<dyn BalanceSource>,
    ) -> Self {
        Self {
            cache,
            limiter,
            source,
            validator: Arc::new(SolanaAddressValidator),
            fan_out: FanOut::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            request_timeout: None,
        }
    }

    pub fn from_settings(settings: &Settings, source: Arc<dyn BalanceSource>) -> anyhow::Result<Self> {
        let limit = NonZeroU32::new(settings.rate_limit.limit)
            .context("rate_limit.limit must be non-zero")?;
        let cache = Arc::new(BalanceCache::with_policy(settings.cache_policy()));
        let limiter = Arc::new(RateLimiter::new(limit, settings.rate_window()));

        info!(
            "BalanceService: ttl={:?} rate={}/{:?} fan_out={} max_batch={}",
            settings.cache_policy().success_ttl(),
            limit,
            settings.rate_window(),
            settings.fan_out.max_concurrency,
            settings.fan_out.max_batch_size
        );

        Ok(Self::new(cache, limiter, source)
            .with_fan_out(FanOut::new(settings.fan_out.max_concurrency))
            .with_max_batch_size(settings.fan_out.max_batch_size)
            .with_request_timeout(settings.request_timeout()))
    }

    pub fn with_validator(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Outer deadline for a batch. Keys unresolved when it passes report a timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Rate-limits `client_id`, then runs [`get_balances`](Self::get_balances).
    pub async fn lookup(
        &self,
        client_id: &str,
        wallets: &[String],
    ) -> Result<BalanceReport, BalanceError> {
        if let Admission::Denied { retry_after } = self.limiter.check(client_id) {
            return Err(BalanceError::RateLimited { retry_after });
        }
        self.get_balances(wallets).await
    }

    pub async fn get_balances(&self, wallets: &[String]) -> Result<BalanceReport, BalanceError> {
        let keys = self.prepare_batch(wallets)?;
        metrics::record_batch_size(keys.len());

        let deadline = self.request_timeout.map(|timeout| Instant::now() + timeout);
        let cache = self.cache.clone();
        let source = self.source.clone();
        let resolved = self
            .fan_out
            .execute(keys, deadline, move |key| {
                let cache = cache.clone();
                let source = source.clone();
                async move {
                    let wallet = key.clone();
                    cache
                        .resolve(&key, move || async move { source.get_balance(&wallet).await })
                        .await
                }
            })
            .await;

        let cached_any = resolved.iter().any(|r| r.resolution.from_cache());
        let results = resolved
            .into_iter()
            .map(|r| match r.resolution.outcome {
                Ok(value) => LookupResult {
                    key: r.key,
                    value,
                    error: None,
                },
                Err(e) => LookupResult {
                    key: r.key,
                    value: 0,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        Ok(BalanceReport {
            results,
            cached_any,
        })
    }

    /// Trims, drops blanks and duplicates, and validates. One bad wallet
    /// rejects the whole batch.
    fn prepare_batch(&self, wallets: &[String]) -> Result<Vec<String>, BalanceError> {
        if wallets.is_empty() {
            return Err(BalanceError::EmptyBatch);
        }
        if wallets.len() > self.max_batch_size {
            return Err(BalanceError::TooManyKeys {
                max: self.max_batch_size,
            });
        }

        let mut seen = HashSet::with_capacity(wallets.len());
        let mut keys = Vec::with_capacity(wallets.len());
        for raw in wallets {
            let wallet = raw.trim();
            if wallet.is_empty() || !seen.insert(wallet) {
                continue;
            }
            if let Err(reason) = self.validator.validate(wallet) {
                debug!("BalanceService: rejecting batch, {} is invalid: {}", wallet, reason);
                return Err(BalanceError::InvalidKey(wallet.to_string()));
            }
            keys.push(wallet.to_string());
        }

        if keys.is_empty() {
            return Err(BalanceError::NoValidKeys);
        }
        Ok(keys)
    }
}
