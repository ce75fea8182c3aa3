// Shared upstream stub for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use solana_balance_gateway::{BalanceSource, UpstreamError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted balance source: per-wallet balances, failures and delays, with
/// call counting.
#[derive(Default)]
pub struct StubSource {
    balances: HashMap<String, u64>,
    failures: HashMap<String, UpstreamError>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    calls: AtomicUsize,
    calls_by_wallet: Mutex<HashMap<String, usize>>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, wallet: &str, lamports: u64) -> Self {
        self.balances.insert(wallet.to_string(), lamports);
        self
    }

    pub fn with_failure(mut self, wallet: &str, error: UpstreamError) -> Self {
        self.failures.insert(wallet.to_string(), error);
        self
    }

    pub fn with_delay(mut self, wallet: &str, delay: Duration) -> Self {
        self.delays.insert(wallet.to_string(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, wallet: &str) -> usize {
        self.calls_by_wallet
            .lock()
            .unwrap()
            .get(wallet)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BalanceSource for StubSource {
    async fn get_balance(&self, address: &str) -> Result<u64, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_wallet
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert(0) += 1;

        let delay = self.delays.get(address).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.get(address) {
            return Err(err.clone());
        }
        Ok(self.balances.get(address).copied().unwrap_or(0))
    }
}

/// Accepts any non-empty key, so tests can use short readable wallet names.
pub struct AnyKey;

impl solana_balance_gateway::key_validator::KeyValidator for AnyKey {
    fn validate(&self, key: &str) -> Result<(), String> {
        if key.starts_with("bad") {
            Err("rejected by test validator".to_string())
        } else {
            Ok(())
        }
    }
}

pub fn wallets(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// TCP endpoint that accepts connections and never writes a byte back.
pub async fn spawn_silent_node() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}
