//! Delivery error types and failure classification.
//!
//! The sink signals "do not redeliver" out of band, through
//! [`DeliveryErrorKind::Permanent`]. The message text is never inspected.
//!
//! - **Transient** errors (the default) are retried: the pipeline starts a
//!   retry coordinator and re-raises so the upstream withholds its checkpoint.
//! - **Permanent** errors are reported through a throttled notification and
//!   swallowed so the upstream moves on.
//!
//! Misclassifying something permanent as transient costs a few redundant
//! retries; the opposite silently drops data. Anything unmarked is transient.

use std::fmt;
use thiserror::Error;

/// The kind of delivery error, as tagged by the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    /// Transport faults, timeouts, overload, or anything unclassified.
    #[default]
    Transient,

    /// The sink deliberately refuses this batch and will keep refusing it
    /// (e.g. a validation rejection).
    Permanent,
}

/// The outcome of classifying a delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
}

/// A failed sink call.
#[derive(Debug, Error)]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,

    /// Human-readable description, recorded as the key's last error.
    pub message: String,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeliveryErrorKind::Transient => write!(f, "delivery failed: {}", self.message),
            DeliveryErrorKind::Permanent => {
                write!(f, "delivery permanently rejected: {}", self.message)
            }
        }
    }
}

impl DeliveryError {
    /// Creates a transient (retryable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent (non-retryable) error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Permanent,
            message: message.into(),
            source: None,
        }
    }

    /// Creates the error reported when the sink call exceeds its timeout.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::transient(format!("sink call timed out after {:?}", timeout))
    }

    /// Attaches an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn class(&self) -> FailureClass {
        classify(self)
    }
}

/// Classifies a delivery failure.
///
/// Only an explicit [`DeliveryErrorKind::Permanent`] tag yields
/// [`FailureClass::NonRetryable`].
pub fn classify(error: &DeliveryError) -> FailureClass {
    match error.kind {
        DeliveryErrorKind::Permanent => FailureClass::NonRetryable,
        DeliveryErrorKind::Transient => FailureClass::Retryable,
    }
}
