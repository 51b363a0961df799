//! Kafka consumer groups backed by rdkafka's `StreamConsumer`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::message::{Headers as _, Message as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::failure::Header;
use crate::group::{
    Claim, ClaimHandler, Connect, ConsumerGroup, Delivery, GroupConfig, GroupError, Session,
};

/// A consumer group on a Kafka cluster.
///
/// One consume session spans the whole subscription: rdkafka serialises
/// deliveries per partition internally, so claim processing stays sequential
/// within a partition. Marking a delivery stores its offset; commits happen
/// asynchronously on the auto-commit interval, mirroring the
/// mark-then-commit model of consumer-group clients.
pub struct KafkaGroup {
    consumer: StreamConsumer,
    errors_tx: mpsc::UnboundedSender<GroupError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
}

impl KafkaGroup {
    /// Connect a consumer group as described by `config`.
    #[tracing::instrument(skip_all, fields(group_id = %config.group_id))]
    pub fn try_new(config: &GroupConfig) -> Result<Self, GroupError> {
        let consumer = client_config(config)
            .create::<StreamConsumer>()
            .map_err(GroupError::connect)?;
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Ok(Self {
            consumer,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }
}

fn client_config(config: &GroupConfig) -> ClientConfig {
    let client_id = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut cc = ClientConfig::new();
    cc.set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", &config.group_id)
        .set("client.id", client_id)
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        )
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    if config.tls_enable {
        cc.set("security.protocol", "ssl");
        if config.tls_skip_verify {
            cc.set("enable.ssl.certificate.verification", "false");
        }
    }
    cc
}

struct KafkaSession<'a> {
    consumer: &'a StreamConsumer,
    cancel: CancellationToken,
}

impl Session for KafkaSession<'_> {
    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn mark(&self, delivery: &Delivery) {
        if let Err(error) =
            self.consumer
                .store_offset(&delivery.topic, delivery.partition, delivery.offset)
        {
            tracing::error!(
                ?error,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "failed to store offset for processed message",
            );
        }
    }
}

struct KafkaClaim<'a> {
    consumer: &'a StreamConsumer,
    cancel: CancellationToken,
    errors_tx: mpsc::UnboundedSender<GroupError>,
}

#[async_trait]
impl Claim for KafkaClaim<'_> {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                received = self.consumer.recv() => received,
            };
            match received {
                Ok(message) => {
                    let headers = message
                        .headers()
                        .map(|headers| {
                            headers
                                .iter()
                                .map(|h| {
                                    Header::new(h.key, h.value.unwrap_or_default().to_vec())
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    return Some(Delivery {
                        topic: message.topic().to_owned(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().unwrap_or_default().to_vec(),
                        payload: message.payload().unwrap_or_default().to_vec(),
                        headers,
                    });
                }
                Err(error) => {
                    // Transport errors are surfaced on the error stream; the
                    // claim keeps going.
                    let _ = self.errors_tx.send(GroupError::consume(error));
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), GroupError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(GroupError::consume)?;

        let session = KafkaSession {
            consumer: &self.consumer,
            cancel: cancel.clone(),
        };
        let mut claim = KafkaClaim {
            consumer: &self.consumer,
            cancel,
            errors_tx: self.errors_tx.clone(),
        };

        handler.setup(&session).await.map_err(GroupError::consume)?;
        let result = handler.consume_claim(&session, &mut claim).await;
        handler
            .cleanup(&session)
            .await
            .map_err(GroupError::consume)?;

        result.map_err(GroupError::consume)
    }

    fn errors(&self) -> BoxStream<'static, GroupError> {
        match self.errors_rx.lock().expect("errors lock").take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Connector creating [`KafkaGroup`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaConnector;

#[async_trait]
impl Connect for KafkaConnector {
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn ConsumerGroup>, GroupError> {
        Ok(Arc::new(KafkaGroup::try_new(config)?))
    }
}
