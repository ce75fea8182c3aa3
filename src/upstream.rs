// src/upstream.rs

use crate::errors::UpstreamError;
use crate::metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const GET_BALANCE: &str = "getBalance";

/// Default nested deadline for a single upstream call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// Opaque, single-attempt balance lookup. Implementations never retry.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn get_balance(&self, address: &str) -> Result<u64, UpstreamError>;
}

/// JSON-RPC client for a Solana node, reading balances at `confirmed` commitment.
pub struct SolanaRpcClient {
    client: reqwest::Client,
    url: String,
    call_timeout: Duration,
    limiter: Option<DefaultDirectRateLimiter>,
    next_id: AtomicU64,
}

impl SolanaRpcClient {
    /// `qps_limit` throttles outgoing calls for the whole process; `None` disables it.
    pub fn new(url: &str, call_timeout: Duration, qps_limit: Option<u32>) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("invalid rpc url {}", url))?;
        // The per-call deadline is enforced in `get_balance`, not by reqwest.
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build rpc http client")?;
        let limiter = qps_limit
            .and_then(NonZeroU32::new)
            .map(|qps| RateLimiter::direct(Quota::per_second(qps)));

        Ok(Self {
            client,
            url: url.to_string(),
            call_timeout,
            limiter,
            next_id: AtomicU64::new(1),
        })
    }

    async fn send(&self, address: &str) -> Result<u64, UpstreamError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": GET_BALANCE,
            "params": [address, { "commitment": "confirmed" }],
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.transport_error(e))?;

        let parsed: RpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.call_timeout)
            } else {
                UpstreamError::InvalidResponse(e.without_url().to_string())
            }
        })?;
        parsed.into_balance()
    }

    fn transport_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.call_timeout)
        } else {
            UpstreamError::Transport(e.without_url().to_string())
        }
    }
}

#[async_trait]
impl BalanceSource for SolanaRpcClient {
    async fn get_balance(&self, address: &str) -> Result<u64, UpstreamError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.call_timeout, self.send(address)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UpstreamError::Timeout(self.call_timeout)),
        };
        let duration = start.elapsed();

        metrics::record_upstream_latency(GET_BALANCE, duration);
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(_) => "error",
        };
        metrics::increment_upstream_call(GET_BALANCE, label);
        match &outcome {
            Ok(lamports) => debug!(
                "[RPC] {} {} -> {} lamports in {:?}",
                GET_BALANCE, address, lamports, duration
            ),
            Err(e) => debug!("[RPC] {} {} failed in {:?}: {}", GET_BALANCE, address, duration, e),
        }
        outcome
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<BalanceResult>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn into_balance(self) -> Result<u64, UpstreamError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(UpstreamError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result.value),
            (None, None) => Err(UpstreamError::InvalidResponse(
                "response has neither result nor error".to_string(),
            )),
        }
    }
}
