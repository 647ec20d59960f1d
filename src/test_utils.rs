//! Shared test utilities: proptest generators and scripted collaborators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Map, Value};

use crate::collaborators::{
    Notification, Notifier, NotifyError, OutstandingAttempts, Sink, StatusCheck, StatusCheckError,
};
use crate::delivery::DeliveryError;
use crate::persistence::{MemoryBackend, Namespace, StateBackend, StateStore, StoreError};
use crate::types::{ChangeRecord, Operation, TableKey};

pub fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Insert),
        Just(Operation::Update),
        Just(Operation::Delete),
        Just(Operation::Upsert),
    ]
}

pub fn arb_field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

pub fn arb_record() -> impl Strategy<Value = ChangeRecord> {
    (
        arb_operation(),
        prop::collection::vec(("[A-Za-z]{1,3}", arb_field_value()), 0..8),
    )
        .prop_map(|(operation, pairs)| {
            let fields: Map<String, Value> = pairs.into_iter().collect();
            ChangeRecord::new(TableKey::new("T1"), operation, fields)
        })
}

pub fn arb_batch() -> impl Strategy<Value = Vec<ChangeRecord>> {
    prop::collection::vec(arb_record(), 0..6)
}

/// Sink that answers from a script and records what it was sent.
///
/// Once the script runs out every call succeeds.
#[derive(Debug, Default)]
pub struct ScriptedSink {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    received: Mutex<Vec<(TableKey, Vec<ChangeRecord>)>>,
    hang: AtomicBool,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, result: Result<(), DeliveryError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Makes every subsequent call hang forever.
    pub fn hanging(self) -> Self {
        self.hang.store(true, Ordering::SeqCst);
        self
    }

    pub fn received(&self) -> Vec<(TableKey, Vec<ChangeRecord>)> {
        self.received.lock().unwrap().clone()
    }
}

impl Sink for ScriptedSink {
    async fn send(&self, key: &TableKey, batch: &[ChangeRecord]) -> Result<(), DeliveryError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.received
            .lock()
            .unwrap()
            .push((key.clone(), batch.to_vec()));
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Upstream status collaborator that answers from a script.
///
/// Once the script runs out every check reports nothing outstanding.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Result<OutstandingAttempts, StatusCheckError>>>,
    checks: AtomicU32,
    rearms: AtomicU32,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, answer: Result<OutstandingAttempts, StatusCheckError>) -> Self {
        self.script.lock().unwrap().push_back(answer);
        self
    }

    pub fn then_pending(self, count: u32) -> Self {
        self.then(Ok(OutstandingAttempts::pending(count)))
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn rearms(&self) -> u32 {
        self.rearms.load(Ordering::SeqCst)
    }
}

impl StatusCheck for ScriptedUpstream {
    async fn outstanding_attempts(
        &self,
        _key: &TableKey,
    ) -> Result<OutstandingAttempts, StatusCheckError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(OutstandingAttempts::none()))
    }

    async fn rearm(&self, _key: &TableKey) -> Result<(), StatusCheckError> {
        self.rearms.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Notifier that collects notifications, optionally failing first.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    failures: Mutex<VecDeque<NotifyError>>,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(self, error: NotifyError) -> Self {
        self.failures.lock().unwrap().push_back(error);
        self
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Polls `condition` every millisecond until it holds, panicking after 5s.
///
/// Under paused time each poll advances the clock by one millisecond.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Memory backend whose every operation fails while its switch is on.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    broken: Arc<AtomicBool>,
}

impl FlakyBackend {
    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
        }
        Ok(())
    }
}

impl StateBackend for FlakyBackend {
    fn read(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.read(namespace, key)
    }

    fn write(&self, namespace: Namespace, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write(namespace, key, bytes)
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.remove(namespace, key)
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.keys(namespace)
    }
}

/// Returns a store over a [`FlakyBackend`] and the switch that breaks it.
pub fn flaky_store() -> (StateStore, Arc<AtomicBool>) {
    let backend = FlakyBackend::default();
    let switch = Arc::clone(&backend.broken);
    (StateStore::new(backend), switch)
}
