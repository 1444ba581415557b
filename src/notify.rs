//! Notification sink
//!
//! Telegram delivery behind a `Notifier` trait with an explicit bounded-retry
//! policy. Delivery is best-effort up to the policy's attempt budget; an
//! exhausted budget is returned as an error so the engine can halt the
//! strategy - trading without alerting capability is prohibited.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::NotifierConfig;
use crate::error::NotifyError;

/// Message severity, prefixed onto the delivered text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn prefix(&self) -> &'static str {
        match self {
            Severity::Info => "[INFO]",
            Severity::Warning => "[WARN]",
            Severity::Critical => "[CRITICAL]",
        }
    }
}

/// One delivery attempt; retrying is the service's job
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), String>;
}

/// Bounded retry: `max_attempts` tries with a fixed backoff between them.
/// Modeled as data rather than sleeps buried in the send path so the halt
/// decision has a definite success/failure answer.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

/// Notification service: a notifier plus its retry policy.
pub struct NotifyService {
    notifier: Box<dyn Notifier>,
    policy: RetryPolicy,
}

impl NotifyService {
    pub fn new(notifier: Box<dyn Notifier>, policy: RetryPolicy) -> Self {
        NotifyService { notifier, policy }
    }

    pub fn from_config(config: &NotifierConfig) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
        };
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => NotifyService::new(
                Box::new(TelegramNotifier::new(token.clone(), chat_id.clone())),
                policy,
            ),
            _ => {
                warn!("no telegram credentials configured, notifications go to the log only");
                NotifyService::new(Box::new(LogNotifier), policy)
            }
        }
    }

    /// Deliver a message, retrying per the policy. Returns `Err` only after
    /// every attempt failed.
    pub async fn notify(&self, severity: Severity, message: &str) -> Result<(), NotifyError> {
        let text = format!("{} {}", severity.prefix(), message);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.notifier.send(&text).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, max = self.policy.max_attempts, error = %e, "notification attempt failed");
                    last_error = e;
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        error!(attempts = self.policy.max_attempts, "notification delivery exhausted");
        Err(NotifyError::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}

// ============================================================================
// Telegram implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        TelegramNotifier {
            token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), String> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = TelegramMessage {
            chat_id: &self.chat_id,
            text,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(format!("telegram returned {status}: {body}"))
        }
    }
}

/// Fallback sink when no external channel is configured (paper runs, tests).
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), String> {
        tracing::info!(notification = %text, "notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyNotifier {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, _text: &str) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let service = NotifyService::new(
            Box::new(FlakyNotifier {
                calls: calls.clone(),
                fail_first: 2,
            }),
            policy(3),
        );
        assert!(service.notify(Severity::Info, "hello").await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_is_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let service = NotifyService::new(
            Box::new(FlakyNotifier {
                calls: calls.clone(),
                fail_first: u32::MAX,
            }),
            policy(3),
        );
        let err = service.notify(Severity::Critical, "down").await.unwrap_err();
        assert!(matches!(err, NotifyError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
