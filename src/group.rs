//! The consumer-group capability this library consumes from its log client.
//!
//! The contract is deliberately minimal: a [`Connect`] factory yields a
//! [`ConsumerGroup`]; `consume` runs one session in which a [`ClaimHandler`]
//! is fed messages from a [`Claim`] and commits through a [`Session`];
//! asynchronous transport errors flow through [`ConsumerGroup::errors`].
//!
//! Backends:
//!
//! - [`kafka`] (feature-gated): rdkafka consumer groups
//! - [`inmemory`]: queue-backed groups for tests and local runs

pub mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::failure::Header;

/// One message delivered from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Delivery {
    /// The value of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }
}

/// A stream of deliveries owned by one consume session.
#[async_trait]
pub trait Claim: Send {
    /// The next delivery, or `None` once the claim has ended.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

/// The session a claim is being processed under.
pub trait Session: Send + Sync {
    /// The session's cancellation scope.
    fn cancellation(&self) -> CancellationToken;

    /// Mark a delivery as processed, scheduling its offset for commit.
    fn mark(&self, delivery: &Delivery);
}

/// Processes claims on behalf of a consumer group.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    /// Called once when a session begins.
    async fn setup(&self, _session: &dyn Session) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Called once when a session ends, even after a claim error.
    async fn cleanup(&self, _session: &dyn Session) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Process deliveries until the claim ends or the session is cancelled.
    ///
    /// Returning an error aborts the session; the group surfaces it from
    /// [`ConsumerGroup::consume`].
    async fn consume_claim(
        &self,
        session: &dyn Session,
        claim: &mut dyn Claim,
    ) -> Result<(), tower::BoxError>;
}

/// A connected consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Run one consume session over `topics`.
    ///
    /// Returns when the session is cancelled, the claim source is exhausted,
    /// or the claim handler fails. Callers re-enter `consume` to start the
    /// next session.
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), GroupError>;

    /// Asynchronous transport errors observed by the group.
    ///
    /// The stream can be taken once; later calls yield an empty stream.
    fn errors(&self) -> BoxStream<'static, GroupError>;

    /// Leave the group and release its resources.
    async fn close(&self) -> Result<(), GroupError>;
}

/// Factory for consumer groups.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn ConsumerGroup>, GroupError>;
}

/// Connection settings for one consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub session_timeout: Duration,
    pub tls_enable: bool,
    pub tls_skip_verify: bool,
}

/// Error returned by consumer-group operations.
///
/// Wraps the backend error and captures a tracing span backtrace for
/// diagnostics.
#[derive(Debug)]
pub struct GroupError {
    context: SpanTrace,
    kind: GroupErrorKind,
}

/// Kinds of consumer-group errors.
#[derive(Debug)]
pub enum GroupErrorKind {
    /// Connecting to the log failed.
    Connect(tower::BoxError),
    /// A consume session failed.
    Consume(tower::BoxError),
    /// Leaving the group failed.
    Close(tower::BoxError),
}

impl GroupError {
    pub fn connect(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: GroupErrorKind::Connect(err.into()),
        }
    }

    pub fn consume(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: GroupErrorKind::Consume(err.into()),
        }
    }

    pub fn close(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: GroupErrorKind::Close(err.into()),
        }
    }

    pub fn kind(&self) -> &GroupErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            GroupErrorKind::Connect(err) => writeln!(f, "Connect error: {err}"),
            GroupErrorKind::Consume(err) => writeln!(f, "Consume error: {err}"),
            GroupErrorKind::Close(err) => writeln!(f, "Close error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for GroupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            GroupErrorKind::Connect(err)
            | GroupErrorKind::Consume(err)
            | GroupErrorKind::Close(err) => Some(err.as_ref()),
        }
    }
}
