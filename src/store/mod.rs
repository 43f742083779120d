//! Durable log store capability.
//!
//! This module contains:
//! - `LogStore` trait: schema setup and connection acquisition
//! - `LogConnection` trait: insert, delete and the change stream
//! - Change events and the origin filter applied to them
//! - Implementations: in-process memory store, PostgreSQL

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;

use crate::record::{LogRecord, NewRecord, RecordId};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryLogStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLogStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Change stream closed")]
    StreamClosed,

    #[error("Change stream lagged, {0} changes skipped")]
    Lagged(u64),

    #[error("Malformed change: {0}")]
    Decode(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Acknowledgment strength for inserts and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Acknowledge before the write is fully persisted.
    #[default]
    Soft,
    /// Acknowledge only once the write is persisted.
    Hard,
}

/// Kind of a change event, derived from which sides of the change are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change on the relay table.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Row before the change. `None` for inserts.
    pub old: Option<LogRecord>,
    /// Row after the change. `None` for deletes.
    pub new: Option<LogRecord>,
}

impl Change {
    pub fn insert(record: LogRecord) -> Self {
        Self {
            old: None,
            new: Some(record),
        }
    }

    pub fn delete(record: LogRecord) -> Self {
        Self {
            old: Some(record),
            new: None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Update,
            _ => ChangeKind::Delete,
        }
    }

    /// The row this change is about.
    pub fn record(&self) -> Option<&LogRecord> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Predicate evaluated by the store before a change reaches the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    /// Drop changes on rows carrying exactly this origin tag.
    pub exclude_origin: Option<String>,
}

impl ChangeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn excluding_origin(origin: impl Into<String>) -> Self {
        Self {
            exclude_origin: Some(origin.into()),
        }
    }

    pub fn matches(&self, change: &Change) -> bool {
        match (&self.exclude_origin, change.record()) {
            (Some(excluded), Some(record)) => record.origin_id != *excluded,
            _ => true,
        }
    }
}

/// Live stream of changes on the relay table.
///
/// Ends when the store stops delivering changes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<Change>> + Send>>;

/// Interface for the durable append log backing the relay.
///
/// Implementations:
/// - `MemoryLogStore`: in-process table shared by every relay holding it
/// - `PostgresLogStore`: PostgreSQL table with a NOTIFY-based change stream
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create the relay table if it does not exist. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Open a connection.
    async fn connect(&self) -> Result<Box<dyn LogConnection>>;
}

/// A connection to the log store.
///
/// Callers must `close` the connection on every exit path, unless it was
/// turned into a change stream with `changes`.
#[async_trait]
pub trait LogConnection: Send {
    /// Insert a record and wait for the store's acknowledgment.
    async fn insert(&mut self, record: NewRecord, durability: Durability) -> Result<RecordId>;

    /// Delete records by id. Returns how many rows were removed.
    async fn delete(&mut self, ids: &[RecordId], durability: Durability) -> Result<u64>;

    /// Turn this connection into a streaming query over the relay table.
    ///
    /// The connection is consumed. The stream holds its own resources and
    /// releases them when dropped.
    async fn changes(self: Box<Self>, filter: ChangeFilter) -> Result<ChangeStream>;

    /// Release the connection.
    async fn close(&mut self) -> Result<()>;
}
