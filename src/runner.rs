//! The single entry point wiring a backend collection to its lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::collection::chain::{ChainCollection, KafkaForwarder};
use crate::collection::{Collection, StartError};
use crate::config::Config;
use crate::group::kafka::KafkaConnector;
use crate::handler::HandlerRegistry;

/// Consume the configured topics until `cancel` fires.
///
/// Selects the backend from the configuration, starts its collection, then
/// blocks on cancellation. On cancellation the log consumers are closed and
/// every task is drained before returning. Startup failures (no topics
/// configured, the log unreachable, the retry store unusable) are returned.
pub async fn start(
    config: Config,
    cancel: CancellationToken,
    handlers: HandlerRegistry,
) -> Result<(), StartError> {
    let mut collection = build_collection(&config, handlers).await?;
    collection.start(cancel.clone()).await?;
    tracing::info!("consumer started");

    cancel.cancelled().await;
    collection.close().await;
    Ok(())
}

async fn build_collection(
    config: &Config,
    handlers: HandlerRegistry,
) -> Result<Box<dyn Collection>, StartError> {
    if config.use_db_for_retry_queue() {
        build_database_collection(config, handlers).await
    } else {
        let forwarder = Arc::new(KafkaForwarder::try_new(config)?);
        Ok(Box::new(ChainCollection::new(
            config.clone(),
            Arc::new(KafkaConnector),
            handlers,
            forwarder,
        )))
    }
}

#[cfg(feature = "sqlx")]
async fn build_database_collection(
    config: &Config,
    handlers: HandlerRegistry,
) -> Result<Box<dyn Collection>, StartError> {
    use crate::collection::database::DatabaseCollection;
    use crate::retry::sqlx::PgRetryStore;

    let dsn = config
        .db_dsn()
        .ok_or_else(|| StartError::config("the database retry queue needs a connection string"))?;
    let pool = sqlx::PgPool::connect(dsn)
        .await
        .map_err(|e| StartError::store(e.into()))?;
    let store = Arc::new(PgRetryStore::try_new(pool).await.map_err(StartError::store)?);

    Ok(Box::new(DatabaseCollection::new(
        config.clone(),
        store,
        Arc::new(KafkaConnector),
        handlers,
    )))
}

#[cfg(not(feature = "sqlx"))]
async fn build_database_collection(
    _config: &Config,
    _handlers: HandlerRegistry,
) -> Result<Box<dyn Collection>, StartError> {
    Err(StartError::config(
        "the database retry queue requires the `sqlx` feature",
    ))
}
