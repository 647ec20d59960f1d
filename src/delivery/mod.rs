//! The synchronous delivery path.
//!
//! For every incoming batch the [`Pipeline`] filters, sends, and on failure
//! classifies and branches:
//!
//! ```text
//! batch ─► filter ─► sink (bounded timeout) ─► Delivered
//!                         │
//!                         └─ error ─► classify ─► record LastError
//!                                        ├─ Retryable ────► ensure coordinator, Err(Retryable)
//!                                        └─ NonRetryable ─► ensure throttler,   Ok(Handled)
//! ```
//!
//! Returning `Err` for retryable failures tells the ingestion layer not to
//! advance its checkpoint, so the upstream redelivers the batch.

pub mod error;
pub mod pipeline;

pub use error::{DeliveryError, DeliveryErrorKind, FailureClass, classify};
pub use pipeline::{DeliveryOutcome, Pipeline, PipelineError};
