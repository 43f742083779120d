//! In-memory log store.
//!
//! Uses a tokio broadcast channel as the change stream. Every relay holding a
//! clone of the same `MemoryLogStore` sees the same table, which makes it the
//! store of choice for running several relay "processes" inside one test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Change, ChangeFilter, ChangeStream, Durability, LogConnection, LogStore, Result, StoreError,
};
use crate::record::{LogRecord, NewRecord, RecordId};

/// Channel capacity for change events.
const CHANNEL_CAPACITY: usize = 1024;

struct Shared {
    records: RwLock<Vec<LogRecord>>,
    durabilities: RwLock<Vec<Durability>>,
    changes: broadcast::Sender<Change>,
    closed: watch::Sender<bool>,
    open_connections: AtomicUsize,
    fail_on_init: RwLock<bool>,
    fail_on_connect: RwLock<bool>,
    fail_on_insert: RwLock<bool>,
    fail_on_delete: RwLock<bool>,
}

/// In-process log store shared by cloning.
#[derive(Clone)]
pub struct MemoryLogStore {
    shared: Arc<Shared>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                records: RwLock::new(Vec::new()),
                durabilities: RwLock::new(Vec::new()),
                changes,
                closed,
                open_connections: AtomicUsize::new(0),
                fail_on_init: RwLock::new(false),
                fail_on_connect: RwLock::new(false),
                fail_on_insert: RwLock::new(false),
                fail_on_delete: RwLock::new(false),
            }),
        }
    }

    pub async fn set_fail_on_init(&self, fail: bool) {
        *self.shared.fail_on_init.write().await = fail;
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.shared.fail_on_connect.write().await = fail;
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.shared.fail_on_insert.write().await = fail;
    }

    pub async fn set_fail_on_delete(&self, fail: bool) {
        *self.shared.fail_on_delete.write().await = fail;
    }

    /// Snapshot of the table in insertion order.
    pub async fn records(&self) -> Vec<LogRecord> {
        self.shared.records.read().await.clone()
    }

    /// Durability requested by every successful insert and delete, in order.
    pub async fn durabilities(&self) -> Vec<Durability> {
        self.shared.durabilities.read().await.clone()
    }

    pub async fn contains(&self, id: &RecordId) -> bool {
        self.shared.records.read().await.iter().any(|r| &r.id == id)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Push a raw change to every open stream without touching the table.
    pub fn inject(&self, change: Change) {
        let _ = self.shared.changes.send(change);
    }

    /// End every open change stream, as if the store went away.
    pub fn close_streams(&self) {
        self.shared.closed.send_replace(true);
        info!("Memory log store change streams closed");
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn init(&self) -> Result<()> {
        if *self.shared.fail_on_init.read().await {
            return Err(StoreError::Query("Mock init failure".to_string()));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn LogConnection>> {
        if *self.shared.fail_on_connect.read().await {
            return Err(StoreError::Connection("Mock connect failure".to_string()));
        }
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            open: true,
        }))
    }
}

/// Connection handle to a `MemoryLogStore`.
pub struct MemoryConnection {
    shared: Arc<Shared>,
    open: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Connection("Connection already closed".to_string()))
        }
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl LogConnection for MemoryConnection {
    async fn insert(&mut self, record: NewRecord, durability: Durability) -> Result<RecordId> {
        self.ensure_open()?;
        if *self.shared.fail_on_insert.read().await {
            return Err(StoreError::Query("Mock insert failure".to_string()));
        }

        let id = RecordId::from(Uuid::new_v4());
        let record = LogRecord::from_new(id.clone(), record);

        // Hold the table lock while announcing so change order matches insert order.
        let mut records = self.shared.records.write().await;
        records.push(record.clone());
        self.shared.durabilities.write().await.push(durability);
        let receivers = self.shared.changes.send(Change::insert(record)).unwrap_or(0);
        debug!(id = %id, receivers = receivers, ?durability, "Inserted relay record");

        Ok(id)
    }

    async fn delete(&mut self, ids: &[RecordId], durability: Durability) -> Result<u64> {
        self.ensure_open()?;
        if *self.shared.fail_on_delete.read().await {
            return Err(StoreError::Query("Mock delete failure".to_string()));
        }

        let mut records = self.shared.records.write().await;
        let (removed, kept): (Vec<_>, Vec<_>) = records
            .drain(..)
            .partition(|record| ids.contains(&record.id));
        *records = kept;
        self.shared.durabilities.write().await.push(durability);

        for record in &removed {
            let _ = self.shared.changes.send(Change::delete(record.clone()));
        }
        Ok(removed.len() as u64)
    }

    async fn changes(self: Box<Self>, filter: ChangeFilter) -> Result<ChangeStream> {
        self.ensure_open()?;

        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return Err(StoreError::StreamClosed);
        }
        let receiver = self.shared.changes.subscribe();
        // Releases the connection; the stream only needs its receiver.
        drop(self);

        let shutdown = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };

        let stream = BroadcastStream::new(receiver)
            .take_until(shutdown)
            .map(|item| match item {
                Ok(change) => Ok(change),
                Err(BroadcastStreamRecvError::Lagged(n)) => Err(StoreError::Lagged(n)),
            })
            .filter(move |item| {
                future::ready(match item {
                    Ok(change) => filter.matches(change),
                    Err(_) => true,
                })
            });

        Ok(Box::pin(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
