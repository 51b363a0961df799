#![doc = include_str!("../README.md")]

pub mod collection;
pub mod config;
pub mod consumer;
pub mod failure;
pub mod group;
pub mod handler;
pub mod retry;

#[cfg(feature = "kafka")]
mod runner;

#[doc(inline)]
pub use config::Config;

#[doc(inline)]
pub use failure::{Failure, Header};

#[doc(inline)]
pub use group::Delivery;

#[doc(inline)]
pub use handler::{Handler, HandlerFn, HandlerRegistry};

#[doc(inline)]
pub use consumer::{Consumer, NEXT_TIME_RETRY};

#[doc(inline)]
pub use collection::{Collection, FailureSink, StartError, StartErrorKind};

#[doc(inline)]
pub use retry::{Retry, RetryStore, StoreError, StoreErrorKind};

#[cfg(feature = "kafka")]
#[doc(inline)]
pub use runner::start;
