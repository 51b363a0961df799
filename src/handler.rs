//! User handlers and the registry that maps topic keys to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::group::Delivery;

/// A user-provided message handler.
///
/// A handler receives every attempt of a message, whether the attempt comes
/// from a main topic, a retry topic, or a database replay. Returning an error
/// routes the message to its next retry stage; returning `Ok` terminates the
/// message successfully.
///
/// The cancellation token is the consuming session's scope; long-running
/// handlers should watch it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        cancel: CancellationToken,
        delivery: Delivery,
    ) -> Result<(), tower::BoxError>;
}

/// Adapter turning an async closure into a [`Handler`].
///
/// ```
/// use redrive::{Delivery, HandlerFn, HandlerRegistry};
///
/// let handlers = HandlerRegistry::new().register(
///     "orders",
///     HandlerFn::new(|_cancel, delivery: Delivery| async move {
///         println!("got {} bytes", delivery.payload.len());
///         Ok(())
///     }),
/// );
/// ```
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(CancellationToken, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    async fn handle(
        &self,
        cancel: CancellationToken,
        delivery: Delivery,
    ) -> Result<(), tower::BoxError> {
        (self.0)(cancel, delivery).await
    }
}

/// Maps topic keys to handlers.
///
/// All stage topics of a chain share one topic key, so a single registration
/// covers the main topic, every retry topic, and database replays.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a topic key.
    pub fn register(mut self, key: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(key.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for a topic key.
    pub fn handler_for(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(key).cloned()
    }
}
