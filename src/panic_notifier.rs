// src/panic_notifier.rs

use anyhow::{Context, Result};
use log::warn;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;
use std::time::Duration;

/// Discord caps message content at 2000 chars; leave room for the code fence.
const MAX_MESSAGE_CHARS: usize = 1800;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct WebhookPayload {
    content: String,
}

/// Posts panic reports to a Discord-compatible webhook.
#[derive(Debug, Clone)]
pub struct PanicNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl PanicNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    pub async fn notify(&self, message: &str) -> Result<()> {
        let payload = WebhookPayload {
            content: format!("```\n{}\n```", trim_to(message, MAX_MESSAGE_CHARS)),
        };
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Fire-and-forget delivery; failures are only logged.
    pub fn spawn_notify(&self, message: String) {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                warn!("Failed to deliver panic report: {}", e);
            }
        });
    }
}

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = RefCell::new(None);
}

static INSTALL_HOOK: Once = Once::new();

/// Chains a panic hook that records the stack of the panicking thread.
/// Idempotent; the previous hook still runs.
pub fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            LAST_PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Stack recorded by the hook for the last panic on this thread, if any.
/// `catch_unwind` returns on the thread that panicked, so call this right after it.
pub fn take_panic_stack() -> Option<String> {
    LAST_PANIC_STACK.with(|slot| slot.borrow_mut().take())
}

pub fn format_panic_report(
    payload: &str,
    method: &str,
    uri: &str,
    at: chrono::DateTime<chrono::Utc>,
    stack: Option<&str>,
) -> String {
    let mut report = format!(
        "PANIC: {}\nURL: {} {}\nTime: {}",
        payload,
        method,
        uri,
        at.to_rfc3339()
    );
    if let Some(stack) = stack {
        report.push_str("\nStack:\n");
        report.push_str(stack);
    }
    report
}

/// Truncates on a char boundary.
fn trim_to(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}
