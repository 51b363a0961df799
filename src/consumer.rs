//! The claim consumer: dispatches deliveries to handlers and routes failed
//! messages into the retry pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing_error::SpanTrace;

use crate::config::Config;
use crate::failure::{Failure, Header};
use crate::group::{Claim, ClaimHandler, Delivery, Session};
use crate::handler::HandlerRegistry;

/// Header carrying the RFC-3339 timestamp a retried message is due at.
pub const NEXT_TIME_RETRY: &str = "NextTimeRetry";

/// Consumes claims from the log on behalf of both backends.
///
/// For each delivery:
///
/// 1. If a [`NEXT_TIME_RETRY`] header is present and in the future, sleep
///    until it is due. The sleep runs on the claim task and stalls later
///    messages of the same partition, which is what preserves per-partition
///    ordering across retry hops.
/// 2. Dispatch to the handler registered under the topic's key.
/// 3. On handler error, emit a [`Failure`] addressed to the next stage in
///    the chain, with a scheduled-retry header appended.
/// 4. Mark the message as processed, even on handler error, because the
///    failure has been accepted by the failure channel by then.
pub struct Consumer {
    config: Config,
    handlers: HandlerRegistry,
    failures: mpsc::Sender<Failure>,
}

impl Consumer {
    pub fn new(config: Config, handlers: HandlerRegistry, failures: mpsc::Sender<Failure>) -> Self {
        Self {
            config,
            handlers,
            failures,
        }
    }

    /// Honour a scheduled-retry header, if any.
    ///
    /// Every header with the scheduled-retry name must parse; the last one
    /// wins. A malformed value is fatal for the claim.
    async fn wait_until_scheduled(&self, delivery: &Delivery) -> Result<(), ClaimError> {
        let mut scheduled: Option<DateTime<Utc>> = None;
        for header in &delivery.headers {
            if header.name == NEXT_TIME_RETRY {
                let raw = std::str::from_utf8(&header.value)
                    .map_err(|e| ClaimError::malformed_retry_header(e))?;
                let at = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| ClaimError::malformed_retry_header(e))?;
                scheduled = Some(at.with_timezone(&Utc));
            }
        }

        if let Some(at) = scheduled {
            let now = Utc::now();
            if at > now {
                if let Ok(wait) = (at - now).to_std() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Ok(())
    }

    /// Route a failed delivery to its next stage.
    ///
    /// On the dead-letter topic there is no next stage; the failure is
    /// dropped with a warning.
    async fn send_to_failure_channel(&self, delivery: &Delivery, cause: tower::BoxError) {
        let next = match self.config.next_topic_in_chain(&delivery.topic) {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(
                    topic = %delivery.topic,
                    "no next topic to send failure to (dead-letter topic being consumed?)",
                );
                return;
            }
        };

        let retry_at = Utc::now() + next.delay;
        let mut failure = Failure::from_delivery(delivery, next.name.clone(), &cause);
        failure
            .headers
            .push(Header::new(NEXT_TIME_RETRY, retry_at.to_rfc3339()));

        if self.failures.send(failure).await.is_err() {
            tracing::error!(topic = %delivery.topic, "failure channel closed, dropping failure");
        }
    }
}

#[async_trait]
impl ClaimHandler for Consumer {
    async fn consume_claim(
        &self,
        session: &dyn Session,
        claim: &mut dyn Claim,
    ) -> Result<(), tower::BoxError> {
        let cancel = session.cancellation();
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("session cancelled, ending claim");
                    return Ok(());
                }
                delivery = claim.next_delivery() => match delivery {
                    Some(delivery) => delivery,
                    None => return Ok(()),
                },
            };

            self.wait_until_scheduled(&delivery).await?;

            tracing::debug!(topic = %delivery.topic, offset = delivery.offset, "processing message");

            let key = self
                .config
                .find_topic_key(&delivery.topic)
                .ok_or_else(|| ClaimError::missing_handler(&delivery.topic))?;
            let handler = self
                .handlers
                .handler_for(key)
                .ok_or_else(|| ClaimError::missing_handler(key))?;

            if let Err(cause) = handler.handle(cancel.clone(), delivery.clone()).await {
                self.send_to_failure_channel(&delivery, cause).await;
            }

            session.mark(&delivery);
        }
    }
}

/// Error aborting a claim.
#[derive(Debug)]
pub struct ClaimError {
    context: SpanTrace,
    kind: ClaimErrorKind,
}

/// Kinds of claim-fatal conditions.
#[derive(Debug)]
pub enum ClaimErrorKind {
    /// No handler is registered for the delivery's topic key.
    MissingHandler(String),
    /// A scheduled-retry header did not parse as RFC-3339.
    MalformedRetryHeader(tower::BoxError),
}

impl ClaimError {
    fn missing_handler(key: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ClaimErrorKind::MissingHandler(key.into()),
        }
    }

    fn malformed_retry_header(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ClaimErrorKind::MalformedRetryHeader(err.into()),
        }
    }

    pub fn kind(&self) -> &ClaimErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ClaimErrorKind::MissingHandler(key) => {
                writeln!(f, "no handler found for topic key '{key}'")
            }
            ClaimErrorKind::MalformedRetryHeader(err) => {
                writeln!(f, "malformed scheduled-retry header: {err}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ClaimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ClaimErrorKind::MissingHandler(_) => None,
            ClaimErrorKind::MalformedRetryHeader(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use crate::group::inmemory::InMemoryGroup;
    use crate::group::ConsumerGroup;
    use crate::handler::HandlerFn;

    fn product_config() -> Config {
        Config::new(vec!["kafka:9092".into()], "grp").with_topic(
            "product",
            vec![Duration::from_secs(1), Duration::from_secs(5)],
        )
    }

    fn delivery(topic: &str, headers: Vec<Header>) -> Delivery {
        Delivery {
            topic: topic.into(),
            partition: 0,
            offset: 10,
            key: b"k1".to_vec(),
            payload: br#"{"foo":"bar"}"#.to_vec(),
            headers,
        }
    }

    struct Harness {
        group: InMemoryGroup,
        consumer: Arc<Consumer>,
        failures: mpsc::Receiver<Failure>,
    }

    fn harness(handlers: HandlerRegistry) -> Harness {
        let (tx, failures) = mpsc::channel(10);
        Harness {
            group: InMemoryGroup::new(),
            consumer: Arc::new(Consumer::new(product_config(), handlers, tx)),
            failures,
        }
    }

    /// Run one consume session for `duration`, then cancel it.
    async fn run_session(harness: &Harness, topics: &[&str], duration: Duration) {
        let cancel = CancellationToken::new();
        let stop = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(duration).await;
                cancel.cancel();
            }
        };
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let (result, ()) = tokio::join!(
            harness
                .group
                .consume(cancel.clone(), &topics, harness.consumer.clone()),
            stop
        );
        result.unwrap();
    }

    #[tokio::test]
    async fn successful_message_is_marked_without_a_failure() {
        let handlers =
            HandlerRegistry::new().register("product", HandlerFn::new(|_c, _d| async { Ok(()) }));
        let mut h = harness(handlers);
        h.group.add_delivery(delivery("product", Vec::new()));

        run_session(&h, &["product"], Duration::from_millis(50)).await;

        assert_eq!(h.group.marked().len(), 1);
        assert!(h.failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_handler_emits_a_failure_and_the_offset_is_still_marked() {
        let handlers = HandlerRegistry::new().register(
            "product",
            HandlerFn::new(|_c, _d| async { Err("something bad happened".into()) }),
        );
        let mut h = harness(handlers);
        h.group.add_delivery(delivery("product", Vec::new()));

        run_session(&h, &["product"], Duration::from_millis(50)).await;

        let failure = h.failures.try_recv().expect("failure emitted");
        assert_eq!(failure.topic, "product");
        assert_eq!(failure.next_topic, "product.retry1");
        assert_eq!(failure.cause, "something bad happened");
        assert_eq!(failure.kafka_offset, 10);

        // Appended scheduled-retry header, due roughly one second out.
        let header = failure
            .headers
            .iter()
            .find(|header| header.name == NEXT_TIME_RETRY)
            .expect("scheduled-retry header appended");
        let at = DateTime::parse_from_rfc3339(std::str::from_utf8(&header.value).unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(at > Utc::now());

        // The failure was accepted before the mark.
        assert_eq!(h.group.marked().len(), 1);
    }

    #[tokio::test]
    async fn scheduled_header_delays_the_handler() {
        let invoked_at = Arc::new(std::sync::Mutex::new(None::<Instant>));
        let handlers = HandlerRegistry::new().register("product", {
            let invoked_at = Arc::clone(&invoked_at);
            HandlerFn::new(move |_c, _d| {
                let invoked_at = Arc::clone(&invoked_at);
                async move {
                    *invoked_at.lock().unwrap() = Some(Instant::now());
                    Ok(())
                }
            })
        });
        let h = harness(handlers);

        let due = Utc::now() + Duration::from_millis(200);
        h.group.add_delivery(delivery(
            "product",
            vec![Header::new(NEXT_TIME_RETRY, due.to_rfc3339())],
        ));

        let started = Instant::now();
        run_session(&h, &["product"], Duration::from_millis(450)).await;

        let invoked = invoked_at.lock().unwrap().expect("handler invoked");
        assert!(invoked.duration_since(started) >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn malformed_scheduled_header_aborts_the_claim() {
        let handlers =
            HandlerRegistry::new().register("product", HandlerFn::new(|_c, _d| async { Ok(()) }));
        let (tx, _failures) = mpsc::channel(10);
        let consumer = Arc::new(Consumer::new(product_config(), handlers, tx));

        let group = InMemoryGroup::new();
        group.add_delivery(delivery(
            "product",
            vec![Header::new(NEXT_TIME_RETRY, b"not a timestamp".to_vec())],
        ));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            group.consume(
                CancellationToken::new(),
                &["product".into()],
                consumer,
            ),
        )
        .await
        .expect("claim aborts promptly");
        assert!(result.is_err());
        assert!(group.marked().is_empty());
    }

    #[tokio::test]
    async fn a_valid_header_does_not_excuse_a_malformed_one() {
        let handlers =
            HandlerRegistry::new().register("product", HandlerFn::new(|_c, _d| async { Ok(()) }));
        let (tx, _failures) = mpsc::channel(10);
        let consumer = Arc::new(Consumer::new(product_config(), handlers, tx));

        let group = InMemoryGroup::new();
        group.add_delivery(delivery(
            "product",
            vec![
                Header::new(NEXT_TIME_RETRY, Utc::now().to_rfc3339()),
                Header::new(NEXT_TIME_RETRY, b"garbage".to_vec()),
            ],
        ));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            group.consume(CancellationToken::new(), &["product".into()], consumer),
        )
        .await
        .expect("claim aborts promptly");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_handler_aborts_the_claim_without_a_failure() {
        let handlers = HandlerRegistry::new();
        let (tx, mut failures) = mpsc::channel(10);
        let consumer = Arc::new(Consumer::new(product_config(), handlers, tx));

        let group = InMemoryGroup::new();
        group.add_delivery(delivery("product", Vec::new()));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            group.consume(CancellationToken::new(), &["product".into()], consumer),
        )
        .await
        .expect("claim aborts promptly");

        let error = result.unwrap_err();
        assert!(error.to_string().contains("no handler found"));
        assert!(failures.try_recv().is_err());
        assert!(group.marked().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_claims_drop_failures_with_a_warning() {
        let handlers = HandlerRegistry::new().register(
            "product",
            HandlerFn::new(|_c, _d| async { Err("still broken".into()) }),
        );
        let mut h = harness(handlers);
        h.group
            .add_delivery(delivery("product.deadLetter", Vec::new()));

        run_session(&h, &["product.deadLetter"], Duration::from_millis(50)).await;

        // No successor stage: nothing forwarded, message still marked.
        assert!(h.failures.try_recv().is_err());
        assert_eq!(h.group.marked().len(), 1);
    }
}
