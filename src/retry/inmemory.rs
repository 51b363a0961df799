//! An in-memory retry store for tests and local usage.
//!
//! Implements the same eligibility predicates as the Postgres store over a
//! plain vector, and adds observation accessors and failure injection for
//! exercising the collections without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::failure::Failure;
use crate::retry::{Retry, RetryStore, StoreError, BATCH_LIMIT, CONSIDERED_STALE_AFTER};

/// A full retry row, lease state included.
#[derive(Debug, Clone)]
pub struct StoredRetry {
    pub retry: Retry,
    pub batch_id: Option<Uuid>,
    pub retry_started_at: Option<DateTime<Utc>>,
    pub retry_finished_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRetry {
    /// A fresh, unleased row around the given retry.
    pub fn new(retry: Retry) -> Self {
        let now = Utc::now();
        Self {
            retry,
            batch_id: None,
            retry_started_at: None,
            retry_finished_at: None,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-memory [`RetryStore`].
#[derive(Default)]
pub struct InMemoryRetryStore {
    rows: Mutex<Vec<StoredRetry>>,
    next_id: AtomicI32,
    published: StdMutex<HashMap<String, usize>>,
    sweeps: AtomicI32,
    fail_on_publish: AtomicBool,
    fail_on_lease: AtomicBool,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `publish_failure` call fail.
    pub fn fail_on_publish(&self) {
        self.fail_on_publish.store(true, Ordering::SeqCst);
    }

    /// Make every `lease_batch` call fail.
    pub fn fail_on_lease(&self) {
        self.fail_on_lease.store(true, Ordering::SeqCst);
    }

    /// How many failures have been published for a topic, deletions
    /// notwithstanding.
    pub fn published_failure_count(&self, topic: &str) -> usize {
        self.published
            .lock()
            .expect("published lock")
            .get(topic)
            .copied()
            .unwrap_or_default()
    }

    /// How many maintenance sweeps have run.
    pub fn sweep_count(&self) -> i32 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored row.
    pub async fn rows(&self) -> Vec<StoredRetry> {
        self.rows.lock().await.clone()
    }

    /// Preload a row, e.g. one with a stale lease.
    pub async fn insert_row(&self, mut row: StoredRetry) {
        if row.retry.id == 0 {
            row.retry.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        }
        self.rows.lock().await.push(row);
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn publish_failure(&self, failure: &Failure) -> Result<(), StoreError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(StoreError::query("publish failure rejected"));
        }

        let headers = serde_json::to_vec(&failure.headers).map_err(StoreError::serde)?;
        let retry = Retry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            topic: failure.topic.clone(),
            payload: failure.payload.clone(),
            headers,
            key: String::from_utf8_lossy(&failure.key).into_owned(),
            kafka_offset: failure.kafka_offset,
            kafka_partition: failure.kafka_partition,
            ..Retry::default()
        };

        self.rows.lock().await.push(StoredRetry::new(retry));
        *self
            .published
            .lock()
            .expect("published lock")
            .entry(failure.topic.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn lease_batch(
        &self,
        topic: &str,
        sequence: i16,
        interval: Duration,
    ) -> Result<Vec<Retry>, StoreError> {
        if self.fail_on_lease.load(Ordering::SeqCst) {
            return Err(StoreError::query("lease rejected"));
        }

        let now = Utc::now();
        let stale_before = now - CONSIDERED_STALE_AFTER;
        let updated_before = now - interval;
        let batch_id = Uuid::new_v4();

        let mut rows = self.rows.lock().await;
        let mut batch = Vec::new();
        for row in rows.iter_mut() {
            if batch.len() as i64 >= BATCH_LIMIT {
                break;
            }
            let leasable = match (row.batch_id, row.retry_started_at, row.retry_finished_at) {
                (None, _, _) => true,
                (Some(_), Some(started), None) => started < stale_before,
                _ => false,
            };
            if row.retry.topic == topic
                && row.retry.attempts == sequence
                && !row.retry.successful
                && !row.retry.deadlettered
                && row.updated_at <= updated_before
                && leasable
            {
                row.batch_id = Some(batch_id);
                row.retry_started_at = Some(now);
                // The lease query only reads the message columns; outcome
                // flags come back clear.
                batch.push(Retry {
                    errored: false,
                    successful: false,
                    deadlettered: false,
                    ..row.retry.clone()
                });
            }
        }
        Ok(batch)
    }

    async fn mark_successful(&self, retry: &Retry) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.retry.id == retry.id)
            .ok_or_else(|| StoreError::query(format!("no retry row with id {}", retry.id)))?;
        row.retry.attempts = retry.attempts;
        row.retry.successful = true;
        row.retry.errored = false;
        row.last_error.clear();
        row.retry_finished_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn mark_errored(&self, retry: &Retry, cause: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.retry.id == retry.id)
            .ok_or_else(|| StoreError::query(format!("no retry row with id {}", retry.id)))?;
        row.batch_id = None;
        row.retry.attempts = retry.attempts;
        row.retry.errored = retry.errored;
        row.retry.deadlettered = retry.deadlettered;
        row.last_error = cause.to_owned();
        row.retry_finished_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn delete_successful_before(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|r| !(r.retry.successful && r.updated_at <= older_than));
        Ok((before - rows.len()) as u64)
    }
}
