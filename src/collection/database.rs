//! The database backend: consume main topics from the log, persist failures
//! to a retry store, and replay them with per-stage polling workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collection::{
    consume_loop, spawn_error_drain, spawn_failure_listener, Collection, FailureSink, StartError,
};
use crate::config::{Config, RetryStage};
use crate::consumer::Consumer;
use crate::failure::Failure;
use crate::group::{ClaimHandler, Connect, ConsumerGroup};
use crate::handler::HandlerRegistry;
use crate::retry::RetryStore;

const DB_RETRY_POLL_INTERVAL: Duration = Duration::from_secs(10);
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A collection that consumes main topics from the log and processes all
/// retries out of a [`RetryStore`].
pub struct DatabaseCollection<S> {
    config: Config,
    store: Arc<S>,
    connector: Arc<dyn Connect>,
    handlers: HandlerRegistry,
    consumer: Arc<Consumer>,
    failure_rx: Option<mpsc::Receiver<Failure>>,
    main_group: Option<Arc<dyn ConsumerGroup>>,
    tasks: Vec<JoinHandle<()>>,
    poll_interval: Duration,
    maintenance_interval: Duration,
}

impl<S> DatabaseCollection<S>
where
    S: RetryStore + 'static,
{
    pub fn new(
        config: Config,
        store: Arc<S>,
        connector: Arc<dyn Connect>,
        handlers: HandlerRegistry,
    ) -> Self {
        let (failure_tx, failure_rx) = mpsc::channel(1);
        let consumer = Arc::new(Consumer::new(config.clone(), handlers.clone(), failure_tx));
        let maintenance_interval = config.maintenance_interval();
        Self {
            config,
            store,
            connector,
            handlers,
            consumer,
            failure_rx: Some(failure_rx),
            main_group: None,
            tasks: Vec::new(),
            poll_interval: DB_RETRY_POLL_INTERVAL,
            maintenance_interval,
        }
    }

    /// Override the stage workers' poll cadence.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Override the maintenance sweep cadence.
    pub fn set_maintenance_interval(&mut self, interval: Duration) {
        self.maintenance_interval = interval;
    }

    fn spawn_stage_workers(&mut self, cancel: &CancellationToken) {
        for topic in self.config.main_topics() {
            let stages = self.config.stages(topic);
            let stage_count = stages.len() as i16;
            for stage in stages {
                let worker = StageWorker {
                    store: Arc::clone(&self.store),
                    handlers: self.handlers.clone(),
                    topic: topic.clone(),
                    stage: stage.clone(),
                    stage_count,
                    poll_interval: self.poll_interval,
                };
                self.tasks.push(tokio::spawn(worker.run(cancel.clone())));
            }
        }
    }

    fn spawn_maintenance(&mut self, cancel: CancellationToken) {
        let store = Arc::clone(&self.store);
        let every = self.maintenance_interval;
        let retention = self.config.successful_retention();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(every) => {
                        let cutoff = Utc::now() - retention;
                        match store.delete_successful_before(cutoff).await {
                            Ok(removed) if removed > 0 => {
                                tracing::debug!(removed, "pruned successful retries");
                            }
                            Ok(_) => {}
                            Err(error) => {
                                tracing::error!(?error, "error running retry store maintenance");
                            }
                        }
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl<S> Collection for DatabaseCollection<S>
where
    S: RetryStore + 'static,
{
    #[tracing::instrument(skip_all)]
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), StartError> {
        let topics = self.config.main_topics().to_vec();
        if topics.is_empty() {
            return Err(StartError::no_topics());
        }
        let failures = self
            .failure_rx
            .take()
            .ok_or_else(|| StartError::config("collection already started"))?;

        tracing::info!(?topics, "starting consumer group for main topics");
        let group = self
            .connector
            .connect(&self.config.group_config(false))
            .await
            .map_err(StartError::connect)?;
        self.tasks.push(spawn_error_drain(&group, cancel.clone()));
        self.tasks.push(tokio::spawn(consume_loop(
            Arc::clone(&group),
            cancel.clone(),
            topics,
            Arc::clone(&self.consumer) as Arc<dyn ClaimHandler>,
        )));
        self.main_group = Some(group);

        self.spawn_stage_workers(&cancel);
        self.tasks.push(spawn_failure_listener(
            Arc::new(StoreSink(Arc::clone(&self.store))),
            failures,
            cancel.clone(),
        ));
        self.spawn_maintenance(cancel);

        Ok(())
    }

    async fn close(&mut self) {
        if let Some(group) = self.main_group.take() {
            if let Err(error) = group.close().await {
                tracing::error!(?error, "error occurred closing the main consumer");
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::error!(?error, "consumer task ended abnormally");
            }
        }
    }
}

/// Failure sink that inserts into the retry store.
struct StoreSink<S>(Arc<S>);

#[async_trait]
impl<S> FailureSink for StoreSink<S>
where
    S: RetryStore + 'static,
{
    async fn deliver(&self, failure: Failure) -> Result<(), tower::BoxError> {
        self.0.publish_failure(&failure).await?;
        Ok(())
    }
}

/// One polling worker for a `(main topic, stage)` pair.
struct StageWorker<S> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    topic: String,
    stage: RetryStage,
    stage_count: i16,
    poll_interval: Duration,
}

impl<S> StageWorker<S>
where
    S: RetryStore,
{
    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {
                    // The batch runs detached from the parent scope so a
                    // shutdown mid-batch still completes the current row
                    // updates; the timeout caps how long that can hold
                    // shutdown up.
                    if tokio::time::timeout(BATCH_TIMEOUT, self.process_batch())
                        .await
                        .is_err()
                    {
                        tracing::error!(
                            topic = %self.topic,
                            sequence = self.stage.sequence,
                            "timed out while processing a retry batch",
                        );
                    }
                }
            }
        }
    }

    async fn process_batch(&self) {
        let batch = match self
            .store
            .lease_batch(&self.topic, self.stage.sequence, self.stage.interval)
            .await
        {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(?error, "error when fetching messages from the store for retry");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let Some(handler) = self.handlers.handler_for(&self.stage.key) else {
            tracing::error!(key = %self.stage.key, "no handler found for topic key");
            return;
        };

        let batch_scope = CancellationToken::new();
        for retry in batch {
            let delivery = retry.to_delivery();
            match handler.handle(batch_scope.clone(), delivery).await {
                Ok(()) => {
                    tracing::info!(
                        topic = %self.topic,
                        partition = retry.kafka_partition,
                        offset = retry.kafka_offset,
                        "successfully processed retried message",
                    );
                    if let Err(error) = self.store.mark_successful(&retry.after_success()).await {
                        tracing::error!(?error, "error marking retried message as successful");
                    }
                }
                Err(cause) => {
                    tracing::error!(error = %cause, "error processing retried message");
                    let updated = retry.after_error(self.stage_count);
                    if let Err(error) = self.store.mark_errored(&updated, &cause.to_string()).await
                    {
                        tracing::error!(?error, "error marking retried message as errored");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::collection::StartErrorKind;
    use crate::failure::Header;
    use crate::group::inmemory::{InMemoryConnector, InMemoryGroup};
    use crate::group::Delivery;
    use crate::handler::{Handler, HandlerFn};
    use crate::retry::inmemory::InMemoryRetryStore;

    fn test_config() -> Config {
        Config::new(vec!["kafka:9092".into()], "grp")
            .with_topic("product", vec![Duration::ZERO, Duration::ZERO])
    }

    fn example_msg() -> Delivery {
        Delivery {
            topic: "product".into(),
            partition: 0,
            offset: 1,
            key: b"k1".to_vec(),
            payload: br#"{"foo":"bar"}"#.to_vec(),
            headers: vec![Header::new("trace-id", b"abc".to_vec())],
        }
    }

    struct TestBed {
        collection: DatabaseCollection<InMemoryRetryStore>,
        group: Arc<InMemoryGroup>,
        store: Arc<InMemoryRetryStore>,
    }

    fn setup(handler: impl Handler + 'static) -> TestBed {
        setup_with_registry(HandlerRegistry::new().register("product", handler))
    }

    fn setup_with_registry(handlers: HandlerRegistry) -> TestBed {
        let group = Arc::new(InMemoryGroup::new());
        let connector = Arc::new(InMemoryConnector::with_groups([Arc::clone(&group)]));
        let store = Arc::new(InMemoryRetryStore::new());
        let mut collection =
            DatabaseCollection::new(test_config(), Arc::clone(&store), connector, handlers);
        collection.set_poll_interval(Duration::from_millis(25));
        TestBed {
            collection,
            group,
            store,
        }
    }

    async fn run_for(bed: &mut TestBed, duration: Duration) {
        let cancel = CancellationToken::new();
        bed.collection.start(cancel.clone()).await.unwrap();
        tokio::time::sleep(duration).await;
        cancel.cancel();
        bed.collection.close().await;
    }

    #[tokio::test]
    async fn errors_when_there_are_no_main_topics() {
        let store = Arc::new(InMemoryRetryStore::new());
        let mut collection = DatabaseCollection::new(
            Config::new(vec!["kafka:9092".into()], "grp"),
            store,
            Arc::new(InMemoryConnector::new()),
            HandlerRegistry::new(),
        );
        let err = collection
            .start(CancellationToken::new())
            .await
            .expect_err("no topics configured");
        assert!(matches!(err.kind(), StartErrorKind::NoTopics));
    }

    #[tokio::test]
    async fn errors_when_it_cannot_connect() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.fail_on_connect();
        let mut collection = DatabaseCollection::new(
            test_config(),
            Arc::new(InMemoryRetryStore::new()),
            connector,
            HandlerRegistry::new(),
        );
        let err = collection
            .start(CancellationToken::new())
            .await
            .expect_err("connect fails");
        assert!(matches!(err.kind(), StartErrorKind::Connect(_)));
    }

    #[tokio::test]
    async fn consume_errors_are_logged_not_fatal() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async { Ok(()) }));
        bed.group.fail_on_consume();

        run_for(&mut bed, Duration::from_millis(60)).await;

        assert!(bed.group.consumed());
    }

    #[tokio::test]
    async fn successful_messages_are_not_retried() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async { Ok(()) }));
        bed.collection
            .set_maintenance_interval(Duration::from_millis(20));
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(90)).await;

        assert_eq!(bed.store.published_failure_count("product"), 0);
        assert!(bed.store.rows().await.is_empty());
        assert_eq!(bed.group.marked().len(), 1);
        assert!(bed.store.sweep_count() >= 2);
    }

    #[tokio::test]
    async fn retries_are_marked_successful_when_they_eventually_succeed() {
        let failed_once = Arc::new(AtomicBool::new(false));
        let mut bed = setup(HandlerFn::new({
            let failed_once = Arc::clone(&failed_once);
            move |_c, _d| {
                let failed_once = Arc::clone(&failed_once);
                async move {
                    if !failed_once.swap(true, Ordering::SeqCst) {
                        return Err("something bad happened".into());
                    }
                    Ok(())
                }
            }
        }));
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(150)).await;

        assert_eq!(bed.store.published_failure_count("product"), 1);
        let rows = bed.store.rows().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].retry.successful);
        assert!(!rows[0].retry.errored);
        assert!(!rows[0].retry.deadlettered);
        assert_eq!(rows[0].retry.attempts, 1);
    }

    #[tokio::test]
    async fn retries_are_dead_lettered_when_they_keep_failing() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async {
            Err("something bad happened".into())
        }));
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(200)).await;

        assert_eq!(bed.store.published_failure_count("product"), 1);
        let rows = bed.store.rows().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].retry.deadlettered);
        assert!(rows[0].retry.errored);
        assert!(!rows[0].retry.successful);
        assert_eq!(rows[0].retry.attempts, 2);
        assert_eq!(rows[0].last_error, "something bad happened");
    }

    #[tokio::test]
    async fn lease_errors_skip_the_tick() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async {
            Err("something bad happened".into())
        }));
        bed.store.fail_on_lease();
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(100)).await;

        assert_eq!(bed.store.published_failure_count("product"), 1);
        let rows = bed.store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry.attempts, 0);
        assert!(!rows[0].retry.errored);
        assert!(rows[0].batch_id.is_none());
    }

    #[tokio::test]
    async fn publish_errors_drop_the_failure() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async {
            Err("something bad happened".into())
        }));
        bed.store.fail_on_publish();
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(100)).await;

        assert!(bed.store.rows().await.is_empty());
        // The offset is committed regardless.
        assert_eq!(bed.group.marked().len(), 1);
    }

    #[tokio::test]
    async fn missing_handler_leaves_the_store_untouched() {
        let mut bed = setup_with_registry(
            HandlerRegistry::new().register("other", HandlerFn::new(|_c, _d| async { Ok(()) })),
        );
        bed.group.add_delivery(example_msg());

        run_for(&mut bed, Duration::from_millis(80)).await;

        // The claim aborts before the handler runs; nothing is published and
        // nothing is marked.
        assert_eq!(bed.store.published_failure_count("product"), 0);
        assert!(bed.store.rows().await.is_empty());
        assert!(bed.group.marked().is_empty());
    }

    #[tokio::test]
    async fn close_closes_the_main_consumer() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async { Ok(()) }));
        run_for(&mut bed, Duration::from_millis(30)).await;
        assert!(bed.group.was_closed());
    }

    #[tokio::test]
    async fn close_without_start_is_a_no_op() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async { Ok(()) }));
        bed.collection.close().await;
        assert!(!bed.group.was_closed());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut bed = setup(HandlerFn::new(|_c, _d| async { Ok(()) }));
        let cancel = CancellationToken::new();
        bed.collection.start(cancel.clone()).await.unwrap();
        let err = bed
            .collection
            .start(cancel.clone())
            .await
            .expect_err("second start");
        assert!(matches!(err.kind(), StartErrorKind::Config(_)));
        cancel.cancel();
        bed.collection.close().await;
    }
}
