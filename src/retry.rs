//! The persisted retry queue behind the database backend.
//!
//! A [`Retry`] is the stored counterpart of a [`Failure`](crate::Failure):
//! one row per failed message, carrying the original bytes, provenance, and
//! an attempt counter that selects the stage the row is a candidate for.
//! [`RetryStore`] is the storage contract; backends live in [`sqlx`]
//! (Postgres, feature-gated) and [`inmemory`].

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing_error::SpanTrace;

use crate::failure::{Failure, Header};
use crate::group::Delivery;

/// How long an unfinished lease may be held before another worker may
/// reclaim its rows.
pub const CONSIDERED_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Upper bound on rows claimed by one lease.
pub const BATCH_LIMIT: i64 = 250;

/// One persisted retry.
///
/// A lease populates the message fields and `attempts`; the outcome flags
/// start false and are set by the stage worker (via [`Retry::after_success`]
/// or [`Retry::after_error`]) before the corresponding mark call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retry {
    pub id: i32,
    /// The logical topic being retried, not a stage-specific name.
    pub topic: String,
    pub payload: Vec<u8>,
    /// Serialised header list, as stored.
    pub headers: Vec<u8>,
    pub key: String,
    pub kafka_offset: i64,
    pub kafka_partition: i32,
    /// Completed attempts so far; a row with `attempts = s` is a candidate
    /// for stage `s`.
    pub attempts: i16,
    pub errored: bool,
    pub successful: bool,
    pub deadlettered: bool,
}

impl Retry {
    /// Rebuild a delivery for handler invocation.
    ///
    /// A header blob that no longer deserialises degrades to an empty header
    /// list rather than poisoning the row.
    pub fn to_delivery(&self) -> Delivery {
        let headers: Vec<Header> = serde_json::from_slice(&self.headers).unwrap_or_default();
        Delivery {
            topic: self.topic.clone(),
            partition: self.kafka_partition,
            offset: self.kafka_offset,
            key: self.key.clone().into_bytes(),
            payload: self.payload.clone(),
            headers,
        }
    }

    /// The state to persist after a successful attempt.
    pub fn after_success(&self) -> Retry {
        let mut updated = self.clone();
        updated.attempts += 1;
        updated.errored = false;
        updated.successful = true;
        updated
    }

    /// The state to persist after a failed attempt, given the number of
    /// configured stages. The row is dead-lettered once the last stage has
    /// been used up.
    pub fn after_error(&self, stage_count: i16) -> Retry {
        let mut updated = self.clone();
        updated.attempts += 1;
        updated.errored = true;
        updated.deadlettered = updated.attempts >= stage_count;
        updated
    }
}

/// Storage contract for the database retry queue.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert a new retry row for a failure, with zero attempts and all
    /// outcome flags clear.
    async fn publish_failure(&self, failure: &Failure) -> Result<(), StoreError>;

    /// Atomically claim up to [`BATCH_LIMIT`] rows for one processing pass.
    ///
    /// A row is eligible when it belongs to `topic`, has `attempts =
    /// sequence`, is neither successful nor dead-lettered, was last updated
    /// at least `interval` ago, and is either unleased or held by a lease
    /// that started more than [`CONSIDERED_STALE_AFTER`] ago without
    /// finishing. The claim runs as two statements (an update minting a
    /// fresh batch id, then a select of that batch) and needs no
    /// transaction: concurrent workers mint distinct batch ids, so their
    /// update predicates never overlap.
    async fn lease_batch(
        &self,
        topic: &str,
        sequence: i16,
        interval: Duration,
    ) -> Result<Vec<Retry>, StoreError>;

    /// Persist a successful attempt: terminal success, attempts taken from
    /// the supplied row.
    ///
    /// Deliberately keeps `batch_id` set: the `successful` flag alone
    /// excludes the row from future leases, and the untouched batch id
    /// records which lease completed it. Only the errored path releases the
    /// lease.
    async fn mark_successful(&self, retry: &Retry) -> Result<(), StoreError>;

    /// Persist a failed attempt: releases the lease (`batch_id = NULL`) so
    /// the next stage's worker can claim the row, and records the error and
    /// the caller's dead-letter decision.
    async fn mark_errored(&self, retry: &Retry, cause: &str) -> Result<(), StoreError>;

    /// Prune successful rows not updated since `older_than`. Returns the
    /// number of rows removed.
    async fn delete_successful_before(&self, older_than: DateTime<Utc>)
        -> Result<u64, StoreError>;
}

/// Error returned by retry-store operations.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    kind: StoreErrorKind,
}

/// Kinds of retry-store errors.
#[derive(Debug)]
pub enum StoreErrorKind {
    /// The backing store rejected or failed a query.
    Query(tower::BoxError),
    /// A row or failure could not be (de)serialised.
    Serde(tower::BoxError),
}

impl StoreError {
    pub fn query(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Query(err.into()),
        }
    }

    pub fn serde(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Serde(err.into()),
        }
    }

    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StoreErrorKind::Query(err) => writeln!(f, "Query error: {err}"),
            StoreErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StoreErrorKind::Query(err) | StoreErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}
