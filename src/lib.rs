//! # Solana Balance Gateway
//!
//! Batched SOL balance lookups for many wallets at once, served over HTTP.
//!
//! ## Overview
//!
//! A request carries up to a few thousand wallet addresses. The gateway:
//!
//! - **Admits** the caller through a per-client windowed token bucket
//! - **Validates** every address before any upstream work starts
//! - **Fans out** one lookup per distinct wallet under a concurrency cap
//! - **Coalesces** concurrent lookups of the same wallet into one upstream call
//! - **Caches** every outcome, failures included, for a fixed TTL
//!
//! Results come back sorted by wallet, one entry per distinct address, each
//! carrying either a balance in lamports or the error that produced it.
//!
//! ## Layers
//!
//! ### Core
//! [`balance_cache`], [`fan_out`] and [`rate_limiter`] are transport-agnostic
//! and run on any tokio runtime; [`balance_service`] composes them.
//!
//! ### Upstream
//! [`upstream`] talks JSON-RPC to a Solana node.
//!
//! ### HTTP
//! [`api`] and [`middleware`] expose `POST /api/get-balance` with API key
//! auth ([`api_keys`]) and panic reporting ([`panic_notifier`]).

// Core
/// Coalescing TTL cache for per-wallet outcomes
pub mod balance_cache;
/// Bounded, deadline-aware fan-out over a batch of keys
pub mod fan_out;
/// Per-client windowed token bucket
pub mod rate_limiter;
/// Batch lookup facade
pub mod balance_service;
/// Wallet address format checks
pub mod key_validator;

// Upstream
/// Solana JSON-RPC balance source
pub mod upstream;

// HTTP Surface
/// Router and request handlers
pub mod api;
/// Auth, client identity and panic-catching middleware
pub mod middleware;
/// API key stores (static and Postgres)
pub mod api_keys;
/// Webhook panic reports
pub mod panic_notifier;

// Infrastructure
/// Error types
pub mod errors;
/// Configuration loading
pub mod settings;
/// Logger setup
pub mod logging;
/// Metrics (no-ops unless built with `observability`)
pub mod metrics;

pub use balance_cache::{BalanceCache, ExpiryPolicy, FixedTtl, Resolution, ResolveSource};
pub use balance_service::{BalanceReport, BalanceService, LookupResult};
pub use errors::{BalanceError, UpstreamError};
pub use fan_out::FanOut;
pub use rate_limiter::{Admission, RateLimiter};
pub use settings::Settings;
pub use upstream::{BalanceSource, SolanaRpcClient};
