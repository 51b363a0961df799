//! The retry-topic chain backend: consume every stage topic from the log and
//! republish failures to the next topic in the chain.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collection::{
    spawn_error_drain, spawn_failure_listener, Collection, FailureSink, StartError,
};
use crate::config::Config;
use crate::consumer::Consumer;
use crate::failure::Failure;
use crate::group::{ClaimHandler, Connect, ConsumerGroup};
use crate::handler::HandlerRegistry;

/// A collection with one consumer group per stage topic and a forwarder that
/// republishes failures to the next stage.
///
/// Retry-stage groups connect to the retry endpoint when one is configured.
/// Each stage consumer re-enters its consume session on the stage's delay
/// timer; the actual per-message wait is carried by the scheduled-retry
/// header.
pub struct ChainCollection<K> {
    config: Config,
    connector: Arc<dyn Connect>,
    consumer: Arc<Consumer>,
    sink: Arc<K>,
    failure_rx: Option<mpsc::Receiver<Failure>>,
    groups: Vec<Arc<dyn ConsumerGroup>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<K> ChainCollection<K>
where
    K: FailureSink,
{
    pub fn new(
        config: Config,
        connector: Arc<dyn Connect>,
        handlers: HandlerRegistry,
        sink: Arc<K>,
    ) -> Self {
        let (failure_tx, failure_rx) = mpsc::channel(1);
        let consumer = Arc::new(Consumer::new(config.clone(), handlers, failure_tx));
        Self {
            config,
            connector,
            consumer,
            sink,
            failure_rx: Some(failure_rx),
            groups: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl<K> Collection for ChainCollection<K>
where
    K: FailureSink,
{
    #[tracing::instrument(skip_all)]
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), StartError> {
        let topics: Vec<_> = self.config.consumable_topics().cloned().collect();
        if topics.is_empty() {
            return Err(StartError::no_topics());
        }
        let failures = self
            .failure_rx
            .take()
            .ok_or_else(|| StartError::config("collection already started"))?;

        for topic in topics {
            tracing::info!(topic = %topic.name, "starting consumer group");
            let group = self
                .connector
                .connect(&self.config.group_config(!topic.is_main))
                .await
                .map_err(StartError::connect)?;
            self.tasks.push(spawn_error_drain(&group, cancel.clone()));

            let handler = Arc::clone(&self.consumer) as Arc<dyn ClaimHandler>;
            let cancel = cancel.clone();
            let loop_group = Arc::clone(&group);
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(topic.delay) => {
                            if let Err(error) = loop_group
                                .consume(
                                    cancel.clone(),
                                    std::slice::from_ref(&topic.name),
                                    Arc::clone(&handler),
                                )
                                .await
                            {
                                tracing::error!(?error, topic = %topic.name, "error when consuming from the log");
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(crate::collection::CONSUME_REENTRY_DELAY) => {}
                                }
                            }
                            if cancel.is_cancelled() {
                                return;
                            }
                        }
                    }
                }
            }));
            self.groups.push(group);
        }

        self.tasks.push(spawn_failure_listener(
            Arc::clone(&self.sink),
            failures,
            cancel,
        ));

        Ok(())
    }

    async fn close(&mut self) {
        for group in self.groups.drain(..) {
            if let Err(error) = group.close().await {
                tracing::error!(?error, "error occurred closing a consumer");
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::error!(?error, "consumer task ended abnormally");
            }
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka_forwarder::KafkaForwarder;

#[cfg(feature = "kafka")]
mod kafka_forwarder {
    use std::time::Duration;

    use async_trait::async_trait;
    use rdkafka::config::ClientConfig;
    use rdkafka::message::{Header as KafkaHeader, OwnedHeaders};
    use rdkafka::producer::{FutureProducer, FutureRecord};

    use crate::collection::{FailureSink, StartError};
    use crate::config::Config;
    use crate::failure::Failure;
    use crate::group::GroupError;

    /// Publishes failures to their next stage topic on Kafka.
    ///
    /// A failure that cannot be published is logged and dropped by the
    /// failure listener; the source offset was committed when the failure
    /// left the consumer. Deploy the database backend where that window is
    /// unacceptable.
    pub struct KafkaForwarder {
        producer: FutureProducer,
        timeout: Duration,
    }

    impl KafkaForwarder {
        /// Create a forwarder producing to the configured primary hosts.
        ///
        /// Default send timeout is 5 seconds.
        pub fn try_new(config: &Config) -> Result<Self, StartError> {
            let group = config.group_config(false);
            let mut cc = ClientConfig::new();
            cc.set("bootstrap.servers", group.brokers.join(","));
            if group.tls_enable {
                cc.set("security.protocol", "ssl");
                if group.tls_skip_verify {
                    cc.set("enable.ssl.certificate.verification", "false");
                }
            }
            let producer: FutureProducer = cc
                .create()
                .map_err(|e| StartError::connect(GroupError::connect(e)))?;
            Ok(Self {
                producer,
                timeout: Duration::from_secs(5),
            })
        }

        /// Set a custom timeout for publishing failures.
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    #[async_trait]
    impl FailureSink for KafkaForwarder {
        async fn deliver(&self, failure: Failure) -> Result<(), tower::BoxError> {
            let mut headers = OwnedHeaders::new();
            for header in &failure.headers {
                headers = headers.insert(KafkaHeader {
                    key: &header.name,
                    value: Some(&header.value),
                });
            }

            let record = FutureRecord::to(&failure.next_topic)
                .payload(&failure.payload)
                .key(&failure.key)
                .headers(headers);

            self.producer
                .send(record, self.timeout)
                .await
                .map_err(|(e, _)| -> tower::BoxError { Box::new(e) })?;
            Ok(())
        }
    }
}
