use serde::{Deserialize, Serialize};

use crate::group::Delivery;

/// A single message header as carried on the log and persisted alongside a
/// retry row.
///
/// Header values are opaque bytes; only the scheduled-retry header is ever
/// interpreted by this library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name.
    pub name: String,
    /// Header value bytes.
    pub value: Vec<u8>,
}

impl Header {
    /// Create a header from a name and anything that can be viewed as bytes.
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An in-process record describing a message whose handler returned an error,
/// on its way to the next retry stage.
///
/// Failures are produced by the consumer and drained by a single forwarder:
/// either the chain forwarder, which republishes to [`Failure::next_topic`],
/// or the database forwarder, which inserts a retry row keyed by
/// [`Failure::topic`].
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// The topic the message was read from. For the database backend this is
    /// the logical topic the retry rows are keyed by.
    pub topic: String,
    /// The topic the chain says should carry the next attempt. Empty only
    /// for terminal stages, which are never turned into a `Failure`.
    pub next_topic: String,
    /// Original message payload.
    pub payload: Vec<u8>,
    /// Original message key.
    pub key: Vec<u8>,
    /// Original headers, plus the scheduled-retry header appended by the
    /// consumer.
    pub headers: Vec<Header>,
    /// Offset the message was read at.
    pub kafka_offset: i64,
    /// Partition the message was read from.
    pub kafka_partition: i32,
    /// The handler error, in string form.
    pub cause: String,
}

impl Failure {
    /// Build a failure from a delivery and the error its handler returned.
    pub fn from_delivery(
        delivery: &Delivery,
        next_topic: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self {
            topic: delivery.topic.clone(),
            next_topic: next_topic.into(),
            payload: delivery.payload.clone(),
            key: delivery.key.clone(),
            headers: delivery.headers.clone(),
            kafka_offset: delivery.offset,
            kafka_partition: delivery.partition,
            cause: cause.to_string(),
        }
    }
}
