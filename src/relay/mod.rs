//! Cross-process broadcast relay.
//!
//! A `Relay` holds everything a process shares between its adapters: the
//! configuration, the origin tag drawn at startup, and the log store. Each
//! namespace the host serves gets its own `RelayAdapter` from
//! [`Relay::adapter`].
//!
//! Data flow for a local event:
//! `RelayAdapter::broadcast(remote = false)` delivers locally, then the
//! publisher writes a tagged record. Every other process's subscriber sees the
//! insert, routes it by namespace and calls its own adapter's
//! `broadcast(remote = true)`, which delivers locally and stops there.

use std::sync::Arc;

use tracing::info;

use crate::broadcaster::LocalBroadcaster;
use crate::config::RelayConfig;
use crate::origin::OriginId;
use crate::store::LogStore;

pub mod adapter;
pub mod error;
pub mod publisher;
pub mod router;
pub mod subscriber;

pub use adapter::{AdapterState, PublishTicket, RelayAdapter};
pub use error::{ErrorSink, RelayError};
pub use publisher::{PublishOutcome, Publisher, Retention};
pub use router::{NamespaceRouter, Route, ROOT_NAMESPACE};
pub use subscriber::{Inbound, RelaySubscriber};

/// Process-wide relay context.
#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    origin: OriginId,
    store: Arc<dyn LogStore>,
}

impl Relay {
    /// Create the relay context for this process, drawing a fresh origin tag.
    pub fn new(config: RelayConfig, store: Arc<dyn LogStore>) -> Self {
        let origin = OriginId::generate(config.key_prefix.clone());
        Self::with_origin(config, store, origin)
    }

    pub fn with_origin(config: RelayConfig, store: Arc<dyn LogStore>, origin: OriginId) -> Self {
        info!(
            origin = %origin,
            save_messages = config.save_messages,
            durability = ?config.durability,
            "Relay context created"
        );
        Self {
            config,
            origin,
            store,
        }
    }

    /// Connect to the PostgreSQL log store described by `config`.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: RelayConfig) -> crate::store::Result<Self> {
        let store = crate::store::PostgresLogStore::connect_with(&config.store).await?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Start an adapter for `namespace`, delivering locally through `broadcaster`.
    pub fn adapter(&self, namespace: &str, broadcaster: Arc<dyn LocalBroadcaster>) -> RelayAdapter {
        let store = Arc::clone(&self.store);
        let origin = self.origin.clone();
        let retention = Retention::from_save_messages(self.config.save_messages);
        let durability = self.config.durability;

        RelayAdapter::start(
            namespace,
            self.origin.clone(),
            Arc::clone(&self.store),
            move |namespace| Publisher::new(store, origin, namespace, retention, durability),
            broadcaster,
        )
    }
}
