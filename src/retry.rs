// src/retry.rs

//! Durable retry queue for notification delivery.
//!
//! Failed sends live in the `retry_operations` table and a single background
//! task sweeps them on a fixed interval: re-attempt, delete on success,
//! reschedule with exponential backoff on failure, drop at the cap. The
//! sweeper runs its iterations back to back on one task, so two sweeps can
//! never overlap. Business state never travels through this queue — it only
//! carries notifications.

use chrono::{DateTime, Utc};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Channel, RetryOperation};
use crate::notify::{Notification, NotificationDispatcher};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: i32,
    pub initial_delay_secs: u64,
    pub backoff_multiplier: u32,
    pub max_delay_secs: u64,
}

impl BackoffPolicy {
    /// Delay before attempt `retries + 1`:
    /// `min(initial * multiplier^retries, max)`.
    pub fn delay_after(&self, retries: i32) -> chrono::Duration {
        let exp = self.backoff_multiplier.saturating_pow(retries.max(0) as u32);
        let secs = self
            .initial_delay_secs
            .saturating_mul(exp as u64)
            .min(self.max_delay_secs);
        chrono::Duration::seconds(secs as i64)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub sweep_interval: Duration,
    pub batch_size: i64,
    pub email: BackoffPolicy,
    pub whatsapp: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            batch_size: 50,
            email: BackoffPolicy {
                max_retries: 3,
                initial_delay_secs: 30,
                backoff_multiplier: 2,
                max_delay_secs: 3600,
            },
            whatsapp: BackoffPolicy {
                max_retries: 5,
                initial_delay_secs: 30,
                backoff_multiplier: 2,
                max_delay_secs: 3600,
            },
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            sweep_interval: Duration::from_secs(env_u64(
                "RETRY_SWEEP_INTERVAL_SECS",
                base.sweep_interval.as_secs(),
            )),
            batch_size: env_u64("RETRY_BATCH_SIZE", base.batch_size as u64) as i64,
            email: BackoffPolicy {
                max_retries: env_u64("EMAIL_MAX_RETRIES", base.email.max_retries as u64) as i32,
                initial_delay_secs: env_u64(
                    "RETRY_INITIAL_DELAY_SECS",
                    base.email.initial_delay_secs,
                ),
                backoff_multiplier: env_u64(
                    "RETRY_BACKOFF_MULTIPLIER",
                    base.email.backoff_multiplier as u64,
                ) as u32,
                max_delay_secs: env_u64("RETRY_MAX_DELAY_SECS", base.email.max_delay_secs),
            },
            whatsapp: BackoffPolicy {
                max_retries: env_u64("WHATSAPP_MAX_RETRIES", base.whatsapp.max_retries as u64)
                    as i32,
                initial_delay_secs: env_u64(
                    "RETRY_INITIAL_DELAY_SECS",
                    base.whatsapp.initial_delay_secs,
                ),
                backoff_multiplier: env_u64(
                    "RETRY_BACKOFF_MULTIPLIER",
                    base.whatsapp.backoff_multiplier as u64,
                ) as u32,
                max_delay_secs: env_u64("RETRY_MAX_DELAY_SECS", base.whatsapp.max_delay_secs),
            },
        }
    }

    pub fn policy(&self, channel: Channel) -> BackoffPolicy {
        match channel {
            Channel::Email => self.email,
            Channel::Whatsapp => self.whatsapp,
        }
    }
}

pub struct RetryQueue {
    store: Arc<dyn Store>,
    dispatcher: Arc<NotificationDispatcher>,
    config: RetryConfig,
}

impl RetryQueue {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<NotificationDispatcher>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep(Utc::now()).await {
                    log::error!("retry sweep error: {e}");
                }
                tokio::time::sleep(self.config.sweep_interval).await;
            }
        });
    }

    /// Processes every operation due at `now`. Returns how many were due.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self
            .store
            .due_retry_operations(now, self.config.batch_size)
            .await?;
        let count = due.len();
        for op in due {
            self.process(op, now).await?;
        }
        Ok(count)
    }

    async fn process(&self, op: RetryOperation, now: DateTime<Utc>) -> Result<(), StoreError> {
        let notification: Notification = match serde_json::from_value(op.payload.clone()) {
            Ok(n) => n,
            Err(e) => {
                log::error!("dropping retry operation {} with bad payload: {e}", op.key);
                return self.store.remove_retry_operation(&op.key).await;
            }
        };
        match self.dispatcher.attempt(&notification).await {
            Ok(()) => {
                log::info!("retry {} delivered after {} retries", op.key, op.retries);
                self.store.remove_retry_operation(&op.key).await
            }
            Err(e) => {
                let retries = op.retries + 1;
                if retries >= op.max_retries {
                    // terminal: notifications are best-effort, nothing is
                    // surfaced to the end user
                    log::error!(
                        "retry {} dropped after {} failed retries: {e}",
                        op.key,
                        retries
                    );
                    self.store.remove_retry_operation(&op.key).await
                } else {
                    let next = now + self.config.policy(op.channel).delay_after(retries);
                    self.store
                        .reschedule_retry_operation(&op.key, retries, next, &e.to_string())
                        .await
                }
            }
        }
    }
}
