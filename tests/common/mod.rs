#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use greenhouse_ingest::Services;
use greenhouse_ingest::clock::ManualClock;
use greenhouse_ingest::config::IngestConfig;
use greenhouse_ingest::memory::MemoryStore;
use greenhouse_ingest::storage::{ColumnSpec, Query, Row, Storage, Table};
use parking_lot::Mutex;

pub const START: i64 = 1_700_000_000_000;

/// Wraps a [`MemoryStore`] and records every call made through the storage
/// contract. Writes can be made to fail on demand.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub queries: Mutex<Vec<Query>>,
    pub inserts: Mutex<Vec<(Table, usize)>>,
    pub added_columns: Mutex<Vec<(Table, String)>>,
    fail_writes: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn added(&self, table: Table) -> Vec<String> {
        self.added_columns
            .lock()
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, column)| column.clone())
            .collect()
    }

    pub fn inserted_rows(&self, table: Table) -> usize {
        self.inserts
            .lock()
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn reset_counts(&self) {
        self.queries.lock().clear();
        self.inserts.lock().clear();
        self.added_columns.lock().clear();
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for RecordingStore {
    async fn query(&self, query: &Query) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.clone());
        self.inner.query(query).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        self.inserts.lock().push((table, rows.len()));
        self.inner.insert(table, rows).await
    }

    async fn add_column_if_missing(&self, table: Table, column: &str, spec: ColumnSpec) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        self.added_columns.lock().push((table, column.to_string()));
        self.inner.add_column_if_missing(table, column, spec).await
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<RecordingStore>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&IngestConfig::default())
    }

    pub fn with_config(config: &IngestConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(RecordingStore::new());
        let services = Services::new(store.clone(), clock.clone(), config);
        Self {
            clock,
            store,
            services,
        }
    }

    /// Advances the clock and drops cached schema lookups.
    pub fn tick(&self, millis: i64) {
        self.clock.advance(millis);
        self.services.schema.cache().clear();
    }
}
