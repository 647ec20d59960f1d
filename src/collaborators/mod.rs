//! Boundaries to the systems the relay talks to.
//!
//! These traits define how the relay reaches its collaborators:
//! - [`Sink`]: sends a filtered batch downstream
//! - [`StatusCheck`]: asks the upstream feed whether a key still has
//!   redeliveries outstanding, and re-arms it when it gets stuck
//! - [`Notifier`]: delivers operator notifications
//!
//! Local implementations used by the binary live in the submodules:
//! - [`outbox`]: durable JSON Lines outbox sink
//! - [`ledger`]: redelivery ledger that answers status checks
//! - [`log_notifier`]: notifications emitted through `tracing`
//!
//! The trait-based design enables scripted fakes in tests.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::retry::Transience;
use crate::types::{ChangeRecord, NotifyReason, TableKey};

pub mod ledger;
pub mod log_notifier;
pub mod outbox;

pub use ledger::RedeliveryLedger;
pub use log_notifier::LogNotifier;
pub use outbox::OutboxSink;

/// Sends filtered batches downstream.
///
/// Implementations tag refusals they want never redelivered with
/// [`DeliveryErrorKind::Permanent`](crate::delivery::DeliveryErrorKind::Permanent).
pub trait Sink: Send + Sync + 'static {
    fn send(
        &self,
        key: &TableKey,
        batch: &[ChangeRecord],
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Upstream answer to "is anything still queued for this key?".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutstandingAttempts {
    /// Redelivery attempts the upstream still intends to make.
    pub count: u32,

    /// The upstream hit its own internal limit and needs [`StatusCheck::rearm`].
    pub limit_reached: bool,
}

impl OutstandingAttempts {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn pending(count: u32) -> Self {
        OutstandingAttempts {
            count,
            limit_reached: false,
        }
    }
}

/// Errors from the upstream status collaborator.
#[derive(Debug, Error)]
pub enum StatusCheckError {
    /// The upstream could not be reached. Retried.
    #[error("upstream status unavailable: {0}")]
    Unavailable(String),

    /// The upstream answered but refused the request. Not retried.
    #[error("upstream status request rejected: {0}")]
    Rejected(String),
}

impl Transience for StatusCheckError {
    fn is_transient(&self) -> bool {
        matches!(self, StatusCheckError::Unavailable(_))
    }
}

/// Queries and corrects the upstream's redelivery bookkeeping.
pub trait StatusCheck: Send + Sync + 'static {
    fn outstanding_attempts(
        &self,
        key: &TableKey,
    ) -> impl Future<Output = Result<OutstandingAttempts, StatusCheckError>> + Send;

    /// Brings a stuck attempt counter back to a retryable value.
    fn rearm(&self, key: &TableKey) -> impl Future<Output = Result<(), StatusCheckError>> + Send;
}

/// An operator notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub key: TableKey,
    pub reason: NotifyReason,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Errors from the notify sink.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Transient(String),

    #[error("notification rejected: {0}")]
    Permanent(String),
}

impl Transience for NotifyError {
    fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

/// Delivers operator notifications (email, chat, log, queue...).
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}
