//! Outbound half of the relay: one tagged record per local broadcast.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{RelayError, Result};
use crate::codec::{self, Payload};
use crate::origin::OriginId;
use crate::record::{DeliveryOptions, NewRecord, RecordId};
use crate::store::{Durability, LogConnection, LogStore};

/// What happens to a record once it has been inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retention {
    /// Delete the record as soon as the insert is acknowledged.
    #[default]
    Delete,
    /// Keep every record.
    Keep,
}

impl Retention {
    pub fn from_save_messages(save_messages: bool) -> Self {
        if save_messages {
            Retention::Keep
        } else {
            Retention::Delete
        }
    }
}

/// Result of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Id the store assigned to the record.
    pub id: RecordId,
    /// Whether the record is still in the store.
    pub retained: bool,
}

/// Writes outbound events into the relay table.
pub struct Publisher {
    store: Arc<dyn LogStore>,
    origin: OriginId,
    namespace: String,
    retention: Retention,
    durability: Durability,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn LogStore>,
        origin: OriginId,
        namespace: impl Into<String>,
        retention: Retention,
        durability: Durability,
    ) -> Self {
        Self {
            store,
            origin,
            namespace: namespace.into(),
            retention,
            durability,
        }
    }

    /// Insert one record for `packet`, then delete it unless records are kept.
    ///
    /// Uses a fresh connection that is closed on every exit path.
    #[tracing::instrument(
        name = "relay.publish",
        skip_all,
        fields(namespace = %self.namespace, origin = %self.origin)
    )]
    pub async fn publish(
        &self,
        packet: &Payload,
        options: &DeliveryOptions,
    ) -> Result<PublishOutcome> {
        let record = NewRecord {
            origin_id: self.origin.key(),
            namespace: self.namespace.clone(),
            event: codec::encode(packet)?,
            delivery_options: codec::encode_options(options)?,
        };

        let mut conn = self.store.connect().await.map_err(RelayError::Publish)?;
        let outcome = self.insert_and_clean(conn.as_mut(), record).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to release log store connection");
        }
        outcome
    }

    async fn insert_and_clean(
        &self,
        conn: &mut dyn LogConnection,
        record: NewRecord,
    ) -> Result<PublishOutcome> {
        let id = conn
            .insert(record, self.durability)
            .await
            .map_err(RelayError::Publish)?;
        debug!(id = %id, "Relay record inserted");

        if self.retention == Retention::Keep {
            return Ok(PublishOutcome { id, retained: true });
        }

        conn.delete(std::slice::from_ref(&id), self.durability)
            .await
            .map_err(|source| RelayError::Cleanup {
                id: id.clone(),
                source,
            })?;
        debug!(id = %id, "Relay record deleted");

        Ok(PublishOutcome {
            id,
            retained: false,
        })
    }
}
