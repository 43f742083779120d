//! Inbound half of the relay: tails the change stream for records written by
//! other processes.

use futures::StreamExt;
use tracing::{debug, info, trace, warn};

use super::error::{ErrorSink, RelayError};
use super::router::{NamespaceRouter, Route};
use crate::codec::{self, Payload};
use crate::origin::OriginId;
use crate::record::DeliveryOptions;
use crate::store::{Change, ChangeFilter, ChangeKind, ChangeStream, LogStore, StoreError};

/// A relayed event ready for local delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub packet: Payload,
    pub options: DeliveryOptions,
}

/// One long-lived change stream for one adapter.
pub struct RelaySubscriber {
    origin: OriginId,
    router: NamespaceRouter,
    stream: ChangeStream,
}

impl RelaySubscriber {
    /// Open a stream that excludes this process's records.
    ///
    /// The connection used to open it goes into the stream; the subscriber
    /// keeps no other store handle.
    pub async fn open(
        store: &dyn LogStore,
        origin: OriginId,
        router: NamespaceRouter,
    ) -> Result<Self, StoreError> {
        let stream = store
            .connect()
            .await?
            .changes(ChangeFilter::excluding_origin(origin.key()))
            .await?;

        info!(
            namespace = %router.namespace(),
            origin = %origin,
            "Relay subscription opened"
        );

        Ok(Self {
            origin,
            router,
            stream,
        })
    }

    /// Decide what to do with one change.
    ///
    /// Returns `Ok(None)` for anything that is not a fresh insert by another
    /// process into this namespace.
    pub fn handle(&self, change: Change) -> Result<Option<Inbound>, RelayError> {
        if change.kind() != ChangeKind::Insert {
            trace!(kind = ?change.kind(), "Ignoring non-insert change");
            return Ok(None);
        }
        let Some(record) = change.new else {
            return Ok(None);
        };

        // The store matches the exact tag; peers may use another prefix.
        if self.origin.owns(&record.origin_id) {
            debug!(id = %record.id, "Ignoring record from own origin");
            return Ok(None);
        }

        if self.router.route(&record) == Route::Drop {
            return Ok(None);
        }

        let options = codec::decode_options(record.delivery_options).map_err(|source| {
            RelayError::Decode {
                id: record.id,
                source,
            }
        })?;
        let packet = codec::decode(record.event);
        Ok(Some(Inbound { packet, options }))
    }

    /// Consume the stream until it ends, handing deliverable events to `deliver`.
    ///
    /// Bad records and stream errors are reported to `errors` and skipped.
    /// Returns once the stream has ended; the caller decides whether that is fatal.
    pub async fn run<F>(mut self, errors: &ErrorSink, mut deliver: F) -> RelayError
    where
        F: FnMut(Inbound),
    {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(change) => match self.handle(change) {
                    Ok(Some(inbound)) => deliver(inbound),
                    Ok(None) => {}
                    Err(e) => {
                        errors.emit(e);
                    }
                },
                Err(e) => {
                    errors.emit(RelayError::Stream(e));
                }
            }
        }

        warn!(namespace = %self.router.namespace(), "Relay change stream ended");
        RelayError::StreamTerminated
    }
}
