//! Gap-free global sequence numbers.
//!
//! The counter is a single well-known item (`audit_sequence` by default) in an
//! item-id partitioned container, holding `{id, value}` plus the store's etag.
//! It is created lazily with `value = 1` and afterwards only ever changed by
//! conditional replace, so concurrent allocators in any number of processes
//! hand out each number exactly once.
//!
//! Retry rules:
//!
//! - Contention (lost create race, stale etag) retries without limit, with
//!   jittered exponential backoff. Every round has exactly one winner, so the
//!   loop always makes progress.
//! - A transient failure while *reading* the counter is retried a bounded
//!   number of times, then propagated.
//! - A transient failure on the create or replace itself is propagated
//!   immediately: the write may or may not have landed, and guessing would
//!   either hand out a duplicate or skip a number.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result, StoreError};
use crate::partition::PartitionKey;
use crate::store::PartitionedStore;

/// Backoff and retry limits for the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First contention delay (doubled per consecutive retry).
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Retries for transient read failures before giving up.
    pub max_transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(500),
            max_transient_retries: 2,
        }
    }
}

/// Stored shape of the counter item.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Counter {
    id: String,
    value: u64,
}

/// Full jitter: a uniformly random delay in `[0, ceiling]`.
fn jittered(ceiling: Duration) -> Duration {
    let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX).max(1);
    Duration::from_nanos(rand::rng().random_range(0..=nanos))
}

pub struct SequenceAllocator {
    store: Arc<dyn PartitionedStore>,
    container: String,
    counter_id: String,
    retry: RetryPolicy,
}

impl SequenceAllocator {
    pub fn new(
        store: Arc<dyn PartitionedStore>,
        container: impl Into<String>,
        counter_id: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            container: container.into(),
            counter_id: counter_id.into(),
            retry,
        }
    }

    pub fn counter_id(&self) -> &str {
        &self.counter_id
    }

    /// Current counter value without allocating (0 if never used).
    pub async fn peek(&self) -> Result<u64> {
        let key = PartitionKey::single(self.counter_id.as_str());
        match self.store.read(&self.container, &key, &self.counter_id).await {
            Ok(item) => Ok(item.decode::<Counter>(&self.container)?.value),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate the next number.
    pub async fn next(&self) -> Result<u64> {
        let key = PartitionKey::single(self.counter_id.as_str());
        let mut backoff = self.retry.backoff_base;
        let mut transient_failures = 0u32;

        loop {
            let current = match self.store.read(&self.container, &key, &self.counter_id).await {
                Ok(item) => Some(item),
                Err(e) if e.is_not_found() => None,
                Err(e) if e.is_transient() && transient_failures < self.retry.max_transient_retries => {
                    transient_failures += 1;
                    log::debug!(
                        "counter '{}' read failed (attempt {transient_failures}/{}): {e}",
                        self.counter_id,
                        self.retry.max_transient_retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.backoff_max);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let attempt = match current {
                None => {
                    let body = serde_json::to_value(Counter {
                        id: self.counter_id.clone(),
                        value: 1,
                    })?;
                    self.store
                        .create(&self.container, &key, &self.counter_id, &body)
                        .await
                        .map(|_| 1)
                }
                Some(item) => {
                    let counter: Counter = item.decode(&self.container)?;
                    let next = counter.value.checked_add(1).ok_or_else(|| {
                        LedgerError::Store(StoreError::Corrupt {
                            container: self.container.clone(),
                            details: format!("counter '{}' overflowed", self.counter_id),
                        })
                    })?;
                    let body = serde_json::to_value(Counter {
                        id: self.counter_id.clone(),
                        value: next,
                    })?;
                    self.store
                        .replace_if_match(&self.container, &key, &self.counter_id, &body, &item.etag)
                        .await
                        .map(|_| next)
                }
            };

            match attempt {
                Ok(value) => return Ok(value),
                Err(StoreError::Conflict { .. } | StoreError::PreconditionFailed { .. }) => {
                    let wait = jittered(backoff);
                    log::debug!("counter '{}' contention, retrying in {wait:?}", self.counter_id);
                    tokio::time::sleep(wait).await;
                    backoff = (backoff * 2).min(self.retry.backoff_max);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
