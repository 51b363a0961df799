//! Queue-backed consumer groups for tests and local runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::group::{
    Claim, ClaimHandler, Connect, ConsumerGroup, Delivery, GroupConfig, GroupError, Session,
};

/// An in-memory consumer group fed by [`InMemoryGroup::add_delivery`].
///
/// The first consume session drains every queued delivery and then idles
/// until cancelled; marked offsets are recorded for inspection. Error
/// injection mimics a broken connection.
pub struct InMemoryGroup {
    feed: mpsc::UnboundedSender<Delivery>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    marked: Arc<Mutex<Vec<Delivery>>>,
    consumed: AtomicBool,
    closed: AtomicBool,
    fail_on_consume: AtomicBool,
    errors_tx: mpsc::UnboundedSender<GroupError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
}

impl Default for InMemoryGroup {
    fn default() -> Self {
        let (feed, deliveries) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            feed,
            deliveries: Mutex::new(Some(deliveries)),
            marked: Arc::new(Mutex::new(Vec::new())),
            consumed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_on_consume: AtomicBool::new(false),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }
}

impl InMemoryGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a delivery for the next consume session.
    pub fn add_delivery(&self, delivery: Delivery) {
        // The receiver lives as long as the group, so this cannot fail.
        let _ = self.feed.send(delivery);
    }

    /// Make every `consume` call fail.
    pub fn fail_on_consume(&self) {
        self.fail_on_consume.store(true, Ordering::SeqCst);
    }

    /// Inject an error into the group's error stream.
    pub fn inject_error(&self, error: GroupError) {
        let _ = self.errors_tx.send(error);
    }

    /// Deliveries marked as processed so far.
    pub fn marked(&self) -> Vec<Delivery> {
        self.marked.lock().expect("marked lock").clone()
    }

    /// Whether `consume` has been called at least once.
    pub fn consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Whether the group has been closed.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct InMemorySession {
    cancel: CancellationToken,
    marked: Arc<Mutex<Vec<Delivery>>>,
}

impl Session for InMemorySession {
    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn mark(&self, delivery: &Delivery) {
        self.marked.lock().expect("marked lock").push(delivery.clone());
    }
}

struct InMemoryClaim {
    cancel: CancellationToken,
    topics: Vec<String>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Claim for InMemoryClaim {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                delivery = self.deliveries.recv() => delivery?,
            };
            if self.topics.iter().any(|t| *t == delivery.topic) {
                return Some(delivery);
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for InMemoryGroup {
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), GroupError> {
        self.consumed.store(true, Ordering::SeqCst);
        if self.fail_on_consume.load(Ordering::SeqCst) {
            return Err(GroupError::consume("consume failed"));
        }

        let session = InMemorySession {
            cancel: cancel.clone(),
            marked: Arc::clone(&self.marked),
        };

        let deliveries = self.deliveries.lock().expect("deliveries lock").take();
        let Some(deliveries) = deliveries else {
            // A previous session owns the queue; idle until cancelled, as a
            // rebalanced-out member would.
            cancel.cancelled().await;
            return Ok(());
        };

        let mut claim = InMemoryClaim {
            cancel: cancel.clone(),
            topics: topics.to_vec(),
            deliveries,
        };

        handler.setup(&session).await.map_err(GroupError::consume)?;
        let result = handler.consume_claim(&session, &mut claim).await;
        handler
            .cleanup(&session)
            .await
            .map_err(GroupError::consume)?;

        // Hand the queue back for a later session.
        *self.deliveries.lock().expect("deliveries lock") = Some(claim.deliveries);

        result.map_err(GroupError::consume)
    }

    fn errors(&self) -> BoxStream<'static, GroupError> {
        match self.errors_rx.lock().expect("errors lock").take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out in-memory groups.
///
/// Prepared groups are handed out first, in order; once they run out, fresh
/// empty groups are created. Every connection attempt records the
/// [`GroupConfig`] it was given.
#[derive(Default)]
pub struct InMemoryConnector {
    prepared: Mutex<VecDeque<Arc<InMemoryGroup>>>,
    connected: Mutex<Vec<Arc<InMemoryGroup>>>,
    configs: Mutex<Vec<GroupConfig>>,
    fail_on_connect: AtomicBool,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue groups to be handed out by subsequent `connect` calls.
    pub fn with_groups(groups: impl IntoIterator<Item = Arc<InMemoryGroup>>) -> Self {
        Self {
            prepared: Mutex::new(groups.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Make every `connect` call fail.
    pub fn fail_on_connect(&self) {
        self.fail_on_connect.store(true, Ordering::SeqCst);
    }

    /// Groups handed out so far.
    pub fn connected(&self) -> Vec<Arc<InMemoryGroup>> {
        self.connected.lock().expect("connected lock").clone()
    }

    /// The group configs observed by `connect`, in call order.
    pub fn configs(&self) -> Vec<GroupConfig> {
        self.configs.lock().expect("configs lock").clone()
    }
}

#[async_trait]
impl Connect for InMemoryConnector {
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn ConsumerGroup>, GroupError> {
        self.configs
            .lock()
            .expect("configs lock")
            .push(config.clone());
        if self.fail_on_connect.load(Ordering::SeqCst) {
            return Err(GroupError::connect("connect failed"));
        }
        let group = self
            .prepared
            .lock()
            .expect("prepared lock")
            .pop_front()
            .unwrap_or_else(|| Arc::new(InMemoryGroup::new()));
        self.connected
            .lock()
            .expect("connected lock")
            .push(Arc::clone(&group));
        Ok(group)
    }
}
