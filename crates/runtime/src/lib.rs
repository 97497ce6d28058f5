//! Rekon runtime: the reconciliation engine.
//!
//! A [`Reflector`] mirrors remote state into the cache and emits change
//! events; the translator turns those into keys on the work queue; a pool of
//! workers reconciles one key at a time. [`Controller`] wires the pieces and
//! owns their lifecycle.

#![forbid(unsafe_code)]

mod config;
mod controller;
mod error;
mod reflector;
mod retry;
mod translate;

pub use config::{ControllerConfig, GiveUpPolicy};
pub use controller::{Controller, Reconciler};
pub use error::{ControllerError, ErrorSink, LogSink, ReconcileError};
pub use reflector::Reflector;
pub use retry::{retry_on_conflict, RetryBackoff};
pub use translate::enqueue_changes;

pub mod prelude {
    pub use super::{Controller, ControllerConfig, ReconcileError, Reconciler};
    pub use rekon_core::prelude::*;
}
