//! Relay errors and the per-adapter error channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::error;

use super::adapter::AdapterState;
use crate::codec::CodecError;
use crate::record::RecordId;
use crate::store::StoreError;

/// Capacity of each adapter's error channel.
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by an adapter.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Schema setup, connect or stream-open failed. Terminal for the adapter.
    #[error("Relay initialization failed: {0}")]
    Initialization(#[source] StoreError),

    /// A relayed record could not be reconstructed. The record is skipped.
    #[error("Failed to decode relay record {id}: {source}")]
    Decode {
        id: RecordId,
        #[source]
        source: CodecError,
    },

    /// An outbound event could not be normalized.
    #[error("Failed to encode outbound event: {0}")]
    Encode(#[from] CodecError),

    /// Connect or insert failed while publishing. Remote nodes miss the event.
    #[error("Publish failed: {0}")]
    Publish(#[source] StoreError),

    /// The record was relayed but could not be deleted afterwards.
    #[error("Failed to delete relay record {id}: {source}")]
    Cleanup {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    /// The change stream reported an error and kept going.
    #[error("Change stream error: {0}")]
    Stream(#[source] StoreError),

    /// The change stream ended. Terminal for the adapter.
    #[error("Change stream terminated")]
    StreamTerminated,

    #[error("Adapter not ready (state: {0:?})")]
    NotReady(AdapterState),
}

/// Fan-out of relay errors to every observer of one adapter.
#[derive(Clone)]
pub struct ErrorSink {
    namespace: String,
    sender: broadcast::Sender<Arc<RelayError>>,
}

impl ErrorSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            sender,
        }
    }

    /// Log an error and hand it to every current observer.
    pub fn emit(&self, err: RelayError) -> Arc<RelayError> {
        error!(namespace = %self.namespace, error = %err, "Relay error");
        let err = Arc::new(err);
        // No observers is fine; the error has been logged.
        let _ = self.sender.send(Arc::clone(&err));
        err
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RelayError>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let sink = ErrorSink::new("/");
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(RelayError::StreamTerminated);

        assert!(matches!(
            *first.recv().await.unwrap(),
            RelayError::StreamTerminated
        ));
        assert!(matches!(
            *second.recv().await.unwrap(),
            RelayError::StreamTerminated
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = ErrorSink::new("/");
        let err = sink.emit(RelayError::Publish(StoreError::Connection(
            "refused".to_string(),
        )));
        assert_eq!(err.to_string(), "Publish failed: Connection failed: refused");
    }
}
