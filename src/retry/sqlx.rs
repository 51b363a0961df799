//! Postgres retry store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::failure::Failure;
use crate::retry::{Retry, RetryStore, StoreError, BATCH_LIMIT, CONSIDERED_STALE_AFTER};

/// Postgres-backed [`RetryStore`] over the `kafka_consumer_retries` table.
#[derive(Clone)]
pub struct PgRetryStore {
    pool: PgPool,
}

impl PgRetryStore {
    /// Create a store without touching the database.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store and ensure the retry table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, StoreError> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    async fn create_batch(
        &self,
        topic: &str,
        sequence: i16,
        interval: Duration,
    ) -> Result<Uuid, StoreError> {
        let batch_id = Uuid::new_v4();
        let stale_before = Utc::now() - CONSIDERED_STALE_AFTER;
        let updated_before = Utc::now() - interval;

        sqlx::query(
            "UPDATE kafka_consumer_retries SET batch_id = $1, retry_started_at = NOW()
            WHERE id IN(
                SELECT id FROM kafka_consumer_retries
                WHERE topic = $2
                AND (
                    batch_id IS NULL OR
                    (batch_id IS NOT NULL AND retry_finished_at IS NULL AND retry_started_at < $3)
                )
                AND attempts = $4 AND deadlettered = false AND successful = false AND updated_at <= $5
                LIMIT $6
            )",
        )
        .bind(batch_id)
        .bind(topic)
        .bind(stale_before)
        .bind(sequence)
        .bind(updated_before)
        .bind(BATCH_LIMIT)
        .execute(&self.pool)
        .await?;

        Ok(batch_id)
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Vec<Retry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, topic, payload_json, payload_headers, payload_key, kafka_offset, kafka_partition, attempts
            FROM kafka_consumer_retries WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let key: Option<String> = row.try_get("payload_key")?;
            batch.push(Retry {
                id: row.try_get("id")?,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload_json")?,
                headers: row.try_get("payload_headers")?,
                key: key.unwrap_or_default(),
                kafka_offset: row.try_get("kafka_offset")?,
                kafka_partition: row.try_get("kafka_partition")?,
                attempts: row.try_get("attempts")?,
                errored: false,
                successful: false,
                deadlettered: false,
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl RetryStore for PgRetryStore {
    #[tracing::instrument(skip_all, fields(topic = %failure.topic))]
    async fn publish_failure(&self, failure: &Failure) -> Result<(), StoreError> {
        let headers = serde_json::to_vec(&failure.headers).map_err(StoreError::serde)?;
        sqlx::query(
            "INSERT INTO kafka_consumer_retries(topic, payload_json, payload_headers, kafka_offset, kafka_partition, payload_key)
            VALUES($1, $2, $3, $4, $5, $6)",
        )
        .bind(&failure.topic)
        .bind(&failure.payload)
        .bind(headers)
        .bind(failure.kafka_offset)
        .bind(failure.kafka_partition)
        .bind(String::from_utf8_lossy(&failure.key).into_owned())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(topic, sequence))]
    async fn lease_batch(
        &self,
        topic: &str,
        sequence: i16,
        interval: Duration,
    ) -> Result<Vec<Retry>, StoreError> {
        let batch_id = self.create_batch(topic, sequence, interval).await?;
        self.fetch_batch(batch_id).await
    }

    async fn mark_successful(&self, retry: &Retry) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kafka_consumer_retries
            SET attempts = $1, last_error = '', retry_finished_at = NOW(), errored = false, successful = true, updated_at = NOW()
            WHERE id = $2",
        )
        .bind(retry.attempts)
        .bind(retry.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_errored(&self, retry: &Retry, cause: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kafka_consumer_retries
            SET batch_id = NULL, attempts = $1, last_error = $2, retry_finished_at = NOW(), errored = $3, deadlettered = $4, updated_at = NOW()
            WHERE id = $5",
        )
        .bind(retry.attempts)
        .bind(cause)
        .bind(retry.errored)
        .bind(retry.deadlettered)
        .bind(retry.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_successful_before(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM kafka_consumer_retries WHERE successful = true AND updated_at <= $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

/// Ensure the retry table exists.
async fn create_table(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kafka_consumer_retries (
            id               serial primary key,
            topic            text not null,
            payload_json     bytea not null,
            payload_headers  bytea not null,
            payload_key      text,
            kafka_offset     bigint not null,
            kafka_partition  int  not null,
            attempts         smallint not null default 0,
            batch_id         uuid,
            retry_started_at timestamptz,
            retry_finished_at timestamptz,
            last_error       text not null default '',
            errored          boolean not null default false,
            successful       boolean not null default false,
            deadlettered     boolean not null default false,
            created_at       timestamptz not null default now(),
            updated_at       timestamptz not null default now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::query(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Header;

    fn failure(topic: &str) -> Failure {
        Failure {
            topic: topic.into(),
            next_topic: format!("{topic}.retry1"),
            payload: br#"{"foo":"bar"}"#.to_vec(),
            key: b"k1".to_vec(),
            headers: vec![Header::new("trace-id", b"abc".to_vec())],
            kafka_offset: 42,
            kafka_partition: 3,
            cause: "boom".into(),
        }
    }

    async fn backdate_updates(pool: &PgPool, secs: i32) {
        sqlx::query("UPDATE kafka_consumer_retries SET updated_at = NOW() - make_interval(secs => $1)")
            .bind(secs as f64)
            .execute(pool)
            .await
            .unwrap();
    }

    #[sqlx::test]
    async fn publish_inserts_a_row_with_defaults(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();

        let row = sqlx::query(
            "SELECT topic, payload_key, attempts, successful, errored, deadlettered, batch_id
            FROM kafka_consumer_retries",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(row.get::<String, _>("topic"), "product");
        assert_eq!(row.get::<Option<String>, _>("payload_key").as_deref(), Some("k1"));
        assert_eq!(row.get::<i16, _>("attempts"), 0);
        assert!(!row.get::<bool, _>("successful"));
        assert!(!row.get::<bool, _>("errored"));
        assert!(!row.get::<bool, _>("deadlettered"));
        assert!(row.get::<Option<Uuid>, _>("batch_id").is_none());
    }

    #[sqlx::test]
    async fn lease_claims_rows_and_round_trips_the_message(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 0, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        let retry = &batch[0];
        assert_eq!(retry.topic, "product");
        assert_eq!(retry.kafka_offset, 42);
        assert_eq!(retry.kafka_partition, 3);
        assert_eq!(retry.attempts, 0);

        let delivery = retry.to_delivery();
        assert_eq!(delivery.payload, br#"{"foo":"bar"}"#);
        assert_eq!(delivery.headers, vec![Header::new("trace-id", b"abc".to_vec())]);

        let leased: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kafka_consumer_retries WHERE batch_id IS NOT NULL AND retry_started_at IS NOT NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(leased, 1);
    }

    #[sqlx::test]
    async fn lease_respects_the_interval_gate(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();

        let batch = store
            .lease_batch("product", 0, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[sqlx::test]
    async fn lease_skips_rows_at_another_stage(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 1, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[sqlx::test]
    async fn stale_unfinished_lease_is_reclaimed(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        sqlx::query(
            "UPDATE kafka_consumer_retries
            SET batch_id = $1, retry_started_at = NOW() - interval '15 minutes',
                retry_finished_at = NULL, updated_at = NOW() - interval '15 minutes'",
        )
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await
        .unwrap();

        let batch = store
            .lease_batch("product", 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[sqlx::test]
    async fn recent_unfinished_lease_is_left_alone(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        sqlx::query(
            "UPDATE kafka_consumer_retries
            SET batch_id = $1, retry_started_at = NOW() - interval '1 minute',
                updated_at = NOW() - interval '1 minute'",
        )
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await
        .unwrap();

        let batch = store
            .lease_batch("product", 0, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[sqlx::test]
    async fn mark_successful_is_terminal_and_keeps_the_batch_id(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 0, Duration::ZERO)
            .await
            .unwrap();
        store
            .mark_successful(&batch[0].after_success())
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT attempts, successful, errored, last_error, batch_id, retry_finished_at
            FROM kafka_consumer_retries",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i16, _>("attempts"), 1);
        assert!(row.get::<bool, _>("successful"));
        assert!(!row.get::<bool, _>("errored"));
        assert_eq!(row.get::<String, _>("last_error"), "");
        assert!(row.get::<Option<Uuid>, _>("batch_id").is_some());
        assert!(row
            .get::<Option<DateTime<Utc>>, _>("retry_finished_at")
            .is_some());

        backdate_updates(&pool, 2).await;
        let batch = store
            .lease_batch("product", 1, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[sqlx::test]
    async fn mark_errored_releases_the_lease_for_the_next_stage(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 0, Duration::ZERO)
            .await
            .unwrap();
        store
            .mark_errored(&batch[0].after_error(2), "still failing")
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT attempts, errored, deadlettered, last_error, batch_id FROM kafka_consumer_retries",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i16, _>("attempts"), 1);
        assert!(row.get::<bool, _>("errored"));
        assert!(!row.get::<bool, _>("deadlettered"));
        assert_eq!(row.get::<String, _>("last_error"), "still failing");
        assert!(row.get::<Option<Uuid>, _>("batch_id").is_none());

        backdate_updates(&pool, 2).await;
        let batch = store
            .lease_batch("product", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[sqlx::test]
    async fn dead_lettered_rows_are_never_leased(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 0, Duration::ZERO)
            .await
            .unwrap();
        store
            .mark_errored(&batch[0].after_error(1), "boom")
            .await
            .unwrap();

        backdate_updates(&pool, 2).await;
        for sequence in 0..3 {
            let batch = store
                .lease_batch("product", sequence, Duration::ZERO)
                .await
                .unwrap();
            assert!(batch.is_empty());
        }
    }

    #[sqlx::test]
    async fn sweep_deletes_only_old_successful_rows(pool: PgPool) {
        let store = PgRetryStore::try_new(pool.clone()).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        store.publish_failure(&failure("product")).await.unwrap();
        backdate_updates(&pool, 2).await;

        let batch = store
            .lease_batch("product", 0, Duration::ZERO)
            .await
            .unwrap();
        store
            .mark_successful(&batch[0].after_success())
            .await
            .unwrap();
        sqlx::query("UPDATE kafka_consumer_retries SET updated_at = NOW() - interval '10 minutes' WHERE successful = true")
            .execute(&pool)
            .await
            .unwrap();

        let removed = store
            .delete_successful_before(Utc::now() - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kafka_consumer_retries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
