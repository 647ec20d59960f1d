//! Redelivery ledger: the binary's answer to upstream status checks.
//!
//! The HTTP ingestion endpoint is the relay's boundary with the upstream
//! feed. Every batch it answers with `503` is one the upstream must send
//! again, so the ledger counts those per key and clears the count once a
//! batch for the key goes through. Retry coordinators read the count through
//! [`StatusCheck`].
//!
//! The upstream gives up redelivering after `max_redeliveries` refusals. At
//! that point the ledger reports `limit_reached`, and [`StatusCheck::rearm`]
//! takes one refusal off the count so the next redelivery is accepted again.

use chrono::Utc;

use super::{OutstandingAttempts, StatusCheck, StatusCheckError};
use crate::persistence::{RedeliveryRecord, StateStore, StoreError};
use crate::types::TableKey;

/// Default number of refusals after which the upstream stops redelivering.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Per-key count of batches awaiting redelivery, kept in the state store.
#[derive(Debug, Clone)]
pub struct RedeliveryLedger {
    store: StateStore,
    max_redeliveries: u32,
}

impl RedeliveryLedger {
    pub fn new(store: StateStore, max_redeliveries: u32) -> Self {
        RedeliveryLedger {
            store,
            max_redeliveries,
        }
    }

    /// Records that a batch for `key` was refused. Returns the new count.
    pub fn record_failure(&self, key: &TableKey) -> Result<u32, StoreError> {
        let next = self
            .store
            .update::<RedeliveryRecord, _>(key.as_str(), |current| {
                Some(RedeliveryRecord {
                    outstanding: current.map_or(0, |r| r.outstanding).saturating_add(1),
                    updated_at: Utc::now(),
                })
            })?;
        Ok(next.map_or(0, |r| r.outstanding))
    }

    /// Records that a batch for `key` went through; nothing is outstanding.
    pub fn record_success(&self, key: &TableKey) -> Result<(), StoreError> {
        self.store.delete::<RedeliveryRecord>(key.as_str())?;
        Ok(())
    }

    /// Returns the current outstanding count for `key`.
    pub fn outstanding(&self, key: &TableKey) -> Result<u32, StoreError> {
        Ok(self
            .store
            .get::<RedeliveryRecord>(key.as_str())?
            .map_or(0, |r| r.outstanding))
    }

    fn decrement(&self, key: &TableKey) -> Result<(), StoreError> {
        self.store
            .update::<RedeliveryRecord, _>(key.as_str(), |current| {
                current.map(|r| RedeliveryRecord {
                    outstanding: r.outstanding.saturating_sub(1),
                    updated_at: Utc::now(),
                })
            })?;
        Ok(())
    }
}

fn unavailable(e: StoreError) -> StatusCheckError {
    StatusCheckError::Unavailable(e.to_string())
}

impl StatusCheck for RedeliveryLedger {
    async fn outstanding_attempts(
        &self,
        key: &TableKey,
    ) -> Result<OutstandingAttempts, StatusCheckError> {
        let count = self.outstanding(key).map_err(unavailable)?;
        Ok(OutstandingAttempts {
            count,
            limit_reached: self.max_redeliveries > 0 && count >= self.max_redeliveries,
        })
    }

    async fn rearm(&self, key: &TableKey) -> Result<(), StatusCheckError> {
        self.decrement(key).map_err(unavailable)
    }
}
