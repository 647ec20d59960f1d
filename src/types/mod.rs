//! Core domain types for the change relay.
//!
//! Identifiers and the change-record shape shared by every component.

pub mod ids;
pub mod record;

pub use ids::{InstanceKey, NotifyReason, TableKey};
pub use record::{Batch, ChangeRecord, Operation};
