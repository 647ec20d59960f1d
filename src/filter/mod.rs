//! Field filtering against per-key allow-lists.
//!
//! A key's effective allow-list is the union of:
//! - the static list from [`RelayConfig`](crate::config::RelayConfig), and
//! - the client-set override persisted as [`ClientAllowedColumns`].
//!
//! If neither is present the batch passes through untouched. Matching is
//! case-insensitive. The lookup set is built once per [`FieldFilter::filter`]
//! call, so filtering is linear in the total number of fields.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, instrument};

use crate::persistence::{ClientAllowedColumns, StateStore, StoreError, check_table_key};
use crate::types::{ChangeRecord, TableKey};

/// Result type for filter operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A case-insensitive set of permitted field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    folded: HashSet<String>,
}

impl AllowList {
    /// Builds an allow-list from individual names. Blank names are ignored.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let folded = names
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref().trim();
                (!name.is_empty()).then(|| name.to_lowercase())
            })
            .collect();
        AllowList { folded }
    }

    /// Parses a comma-separated list such as `"Id, Name"`.
    pub fn parse(csv: &str) -> Self {
        Self::from_names(split_columns(csv))
    }

    /// Adds every name of `other` to this list.
    pub fn extend(&mut self, other: &AllowList) {
        self.folded.extend(other.folded.iter().cloned());
    }

    pub fn contains(&self, field: &str) -> bool {
        if self.folded.contains(field) {
            return true;
        }
        self.folded.contains(&field.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.folded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folded.is_empty()
    }

    /// Returns the (lower-cased) names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.folded.iter().cloned().collect();
        names.sort();
        names
    }

    /// Removes every disallowed field from every record, in place.
    ///
    /// Field order of retained fields is preserved. Returns the number of
    /// fields removed.
    pub fn apply(&self, batch: &mut [ChangeRecord]) -> usize {
        let mut removed = 0;
        for record in batch.iter_mut() {
            let before = record.fields.len();
            record.fields.retain(|name, _| self.contains(name));
            removed += before - record.fields.len();
        }
        removed
    }
}

/// Splits a comma-separated column list, trimming names and dropping blanks.
pub fn split_columns(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves allow-lists and filters batches.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    static_lists: HashMap<TableKey, AllowList>,
    store: StateStore,
}

impl FieldFilter {
    /// Creates a filter from the static per-key lists and the state store.
    pub fn new(static_allowed_columns: &HashMap<TableKey, String>, store: StateStore) -> Self {
        let static_lists = static_allowed_columns
            .iter()
            .map(|(key, csv)| (key.clone(), AllowList::parse(csv)))
            .collect();
        FieldFilter {
            static_lists,
            store,
        }
    }

    /// Returns the effective allow-list for `key`, or `None` if no list applies.
    ///
    /// A present-but-empty static list still counts as a list: every field is
    /// then removed.
    pub fn resolve(&self, key: &TableKey) -> Result<Option<AllowList>> {
        let client = self.store.get::<ClientAllowedColumns>(key.as_str())?;
        let configured = self.static_lists.get(key);

        Ok(match (configured, client) {
            (None, None) => None,
            (Some(configured), None) => Some(configured.clone()),
            (None, Some(client)) => Some(AllowList::from_names(&client.columns)),
            (Some(configured), Some(client)) => {
                let mut merged = configured.clone();
                merged.extend(&AllowList::from_names(&client.columns));
                Some(merged)
            }
        })
    }

    /// Filters `batch` for `key` in place.
    ///
    /// Re-filtering an already filtered batch with the same allow-list is a
    /// no-op.
    #[instrument(skip(self, batch), fields(key = %key, records = batch.len()))]
    pub fn filter(&self, key: &TableKey, batch: &mut [ChangeRecord]) -> Result<()> {
        let Some(allow) = self.resolve(key)? else {
            debug!("No allow-list configured, passing batch through");
            return Ok(());
        };

        let removed = allow.apply(batch);
        debug!(removed, allowed = allow.len(), "Filtered batch");
        Ok(())
    }

    /// Replaces the client-set allow-list for `key`.
    ///
    /// A blank list clears the override.
    #[instrument(skip(self))]
    pub fn set_allowed_columns(&self, key: &TableKey, csv: &str) -> Result<()> {
        check_table_key(key.as_str())?;
        let columns = split_columns(csv);
        if columns.is_empty() {
            self.store.delete::<ClientAllowedColumns>(key.as_str())?;
            return Ok(());
        }

        self.store.put(
            key.as_str(),
            &ClientAllowedColumns {
                columns,
                updated_at: Utc::now(),
            },
        )
    }

    /// Returns the client-set allow-list for `key` as a comma-separated string.
    pub fn get_allowed_columns(&self, key: &TableKey) -> Result<Option<String>> {
        Ok(self
            .store
            .get::<ClientAllowedColumns>(key.as_str())?
            .map(|record| record.columns.join(",")))
    }
}
