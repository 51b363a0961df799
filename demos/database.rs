//! Run the database retry backend against a local Postgres, feeding it one
//! message through an in-memory consumer group.
//!
//! The handler fails the first two attempts, so the message lands in the
//! retry table, is replayed by the stage workers, and ends up marked
//! successful. Watch `kafka_consumer_retries` while it runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redrive::collection::database::DatabaseCollection;
use redrive::collection::Collection;
use redrive::group::inmemory::{InMemoryConnector, InMemoryGroup};
use redrive::retry::sqlx::PgRetryStore;
use redrive::{Config, Delivery, HandlerFn, HandlerRegistry};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();
    let store = Arc::new(PgRetryStore::try_new(pool).await.unwrap());

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let attempts = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new().register("greetings", {
        let attempts = Arc::clone(&attempts);
        HandlerFn::new(move |_cancel, delivery: Delivery| {
            let attempts = Arc::clone(&attempts);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    return Err(format!("not ready on attempt {attempt}").into());
                }
                tracing::info!(
                    payload = %String::from_utf8_lossy(&delivery.payload),
                    attempt,
                    "handled successfully",
                );
                Ok(())
            }
        })
    });

    let group = Arc::new(InMemoryGroup::new());
    group.add_delivery(Delivery {
        topic: "greetings".into(),
        partition: 0,
        offset: 1,
        key: b"hello".to_vec(),
        payload: br#"{"message":"Hello"}"#.to_vec(),
        headers: Vec::new(),
    });

    let config = Config::new(vec!["unused:9092".into()], "demo")
        .with_topic(
            "greetings",
            vec![Duration::from_secs(1), Duration::from_secs(2)],
        )
        .with_db_for_retry_queue(true)
        .with_maintenance_interval(Duration::from_secs(30));

    let connector = Arc::new(InMemoryConnector::with_groups([group]));
    let mut collection = DatabaseCollection::new(config, store, connector, handlers);
    collection.set_poll_interval(Duration::from_secs(1));

    collection.start(cancel.clone()).await.unwrap();
    tracing::info!("running; press Ctrl+C to stop");

    cancel.cancelled().await;
    collection.close().await;
}
