//! Consumer collections: the wiring of consumers, forwarders, and workers
//! for one backend.
//!
//! A [`Collection`] owns every long-running task of a backend under a single
//! cancellation scope. The two backends differ only in how the failure
//! channel is drained and how messages re-enter the pipeline:
//!
//! - [`chain::ChainCollection`] republishes failures to the next retry topic
//!   and consumes every stage topic from the log.
//! - [`database::DatabaseCollection`] persists failures to a retry store and
//!   replays them with polling stage workers.

pub mod chain;
pub mod database;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::failure::Failure;
use crate::group::{ConsumerGroup, GroupError};
use crate::retry::StoreError;

/// Wait before re-entering a consume session that ended in an error.
const CONSUME_REENTRY_DELAY: Duration = Duration::from_secs(1);

/// A started set of consumers and their supporting tasks.
#[async_trait]
pub trait Collection: Send {
    /// Launch every task of the backend under `cancel`.
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), StartError>;

    /// Close the log consumers and wait for every task to finish.
    ///
    /// Call after `cancel` has fired; tasks exit at their next suspension
    /// point.
    async fn close(&mut self);
}

/// Where a drained [`Failure`] goes: the next retry topic or a retry store.
#[async_trait]
pub trait FailureSink: Send + Sync + 'static {
    async fn deliver(&self, failure: Failure) -> Result<(), tower::BoxError>;
}

/// Drain the failure channel into a sink until cancelled.
///
/// A failure the sink rejects is logged and dropped: its source offset was
/// committed when the failure entered the channel, so there is nowhere left
/// to send it back to.
pub(crate) fn spawn_failure_listener<K: FailureSink>(
    sink: Arc<K>,
    mut failures: mpsc::Receiver<Failure>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let failure = tokio::select! {
                _ = cancel.cancelled() => return,
                failure = failures.recv() => match failure {
                    Some(failure) => failure,
                    None => return,
                },
            };
            let topic = failure.topic.clone();
            if let Err(error) = sink.deliver(failure).await {
                tracing::error!(?error, %topic, "failed to forward failure, dropping it");
            }
        }
    })
}

/// Log every asynchronous error a consumer group reports, until the stream
/// ends or the scope is cancelled.
pub(crate) fn spawn_error_drain(
    group: &Arc<dyn ConsumerGroup>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut errors = group.errors();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                error = errors.next() => match error {
                    Some(error) => {
                        tracing::error!(?error, "error occurred in consumer group handler");
                    }
                    None => return,
                },
            }
        }
    })
}

/// Run consume sessions back to back until cancelled, logging session
/// errors. A failed session is re-entered on a timer so a persistently
/// broken connection cannot spin the loop.
pub(crate) async fn consume_loop(
    group: Arc<dyn ConsumerGroup>,
    cancel: CancellationToken,
    topics: Vec<String>,
    handler: Arc<dyn crate::group::ClaimHandler>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(error) = group
            .consume(cancel.clone(), &topics, Arc::clone(&handler))
            .await
        {
            tracing::error!(?error, "error when consuming from the log");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CONSUME_REENTRY_DELAY) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }
    }
}

/// Error returned when a collection cannot be started.
#[derive(Debug)]
pub struct StartError {
    context: SpanTrace,
    kind: StartErrorKind,
}

/// Kinds of startup failures.
#[derive(Debug)]
pub enum StartErrorKind {
    /// The configuration declares no consumable topics.
    NoTopics,
    /// Connecting a consumer group failed.
    Connect(GroupError),
    /// The retry store could not be initialised.
    Store(StoreError),
    /// The configuration is unusable for the selected backend.
    Config(String),
}

impl StartError {
    pub(crate) fn no_topics() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::NoTopics,
        }
    }

    pub(crate) fn connect(err: GroupError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::Connect(err),
        }
    }

    pub(crate) fn store(err: StoreError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::Store(err),
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::Config(msg.into()),
        }
    }

    pub fn kind(&self) -> &StartErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StartErrorKind::NoTopics => {
                writeln!(f, "no topics are configured, therefore cannot start consumers")
            }
            StartErrorKind::Connect(err) => writeln!(f, "could not connect to the log: {err}"),
            StartErrorKind::Store(err) => {
                writeln!(f, "could not initialise the retry store: {err}")
            }
            StartErrorKind::Config(msg) => writeln!(f, "configuration error: {msg}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StartErrorKind::NoTopics | StartErrorKind::Config(_) => None,
            StartErrorKind::Connect(err) => Some(err),
            StartErrorKind::Store(err) => Some(err),
        }
    }
}
