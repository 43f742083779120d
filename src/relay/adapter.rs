//! Per-namespace relay adapter.
//!
//! Composes local delivery, the publisher and the subscriber behind one
//! `broadcast` entry point, and owns the adapter lifecycle:
//!
//! ```text
//! Created -> Connecting -> Ready -> Closed | Failed
//!                 \-----------------------> Failed
//! ```
//!
//! Local delivery works in every state. Publishing and consuming start once
//! the adapter is Ready; broadcasts issued earlier are queued and published in
//! call order once initialization completes.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::{ErrorSink, RelayError};
use super::publisher::{PublishOutcome, Publisher};
use super::router::NamespaceRouter;
use super::subscriber::RelaySubscriber;
use crate::broadcaster::{DeliveryOrigin, LocalBroadcaster};
use crate::codec::Payload;
use crate::origin::OriginId;
use crate::record::DeliveryOptions;
use crate::store::{LogStore, StoreError};

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Connecting,
    Ready,
    Failed,
    Closed,
}

impl AdapterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AdapterState::Failed | AdapterState::Closed)
    }
}

type Readiness = Option<Result<(), Arc<RelayError>>>;
type PublishReply = Result<PublishOutcome, Arc<RelayError>>;

struct PublishRequest {
    packet: Payload,
    options: DeliveryOptions,
    reply: oneshot::Sender<PublishReply>,
}

/// Pending cross-process publish of one local broadcast.
///
/// Dropping the ticket does not cancel the publish.
pub struct PublishTicket {
    reply: oneshot::Receiver<PublishReply>,
}

impl PublishTicket {
    /// Wait for the publish to finish.
    pub async fn outcome(self) -> PublishReply {
        self.reply
            .await
            .unwrap_or_else(|_| Err(Arc::new(RelayError::NotReady(AdapterState::Closed))))
    }
}

struct AdapterInner {
    router: NamespaceRouter,
    origin: OriginId,
    broadcaster: Arc<dyn LocalBroadcaster>,
    state: watch::Sender<AdapterState>,
    readiness: watch::Sender<Readiness>,
    errors: ErrorSink,
    queue: mpsc::UnboundedSender<PublishRequest>,
}

impl AdapterInner {
    fn namespace(&self) -> &str {
        self.router.namespace()
    }

    fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Move to `next` unless the adapter already reached a terminal state.
    fn transition(&self, next: AdapterState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(namespace = %self.namespace(), state = ?next, "Relay adapter state changed");
        }
        changed
    }

    /// Resolve readiness. Only the first resolution sticks.
    fn resolve(&self, result: Result<(), Arc<RelayError>>) {
        self.readiness.send_if_modified(|readiness| {
            if readiness.is_some() {
                false
            } else {
                *readiness = Some(result);
                true
            }
        });
    }

    fn fail(&self, err: RelayError) {
        let err = self.errors.emit(err);
        if self.transition(AdapterState::Failed) {
            self.resolve(Err(err));
        }
    }

    async fn wait_ready(&self) -> Result<(), Arc<RelayError>> {
        let mut readiness = self.readiness.subscribe();
        let resolved = readiness.wait_for(Option::is_some).await;
        match resolved {
            Ok(readiness) => readiness
                .clone()
                .unwrap_or_else(|| Err(Arc::new(RelayError::NotReady(self.state())))),
            Err(_) => Err(Arc::new(RelayError::NotReady(AdapterState::Closed))),
        }
    }

    fn broadcast(
        &self,
        packet: Payload,
        options: DeliveryOptions,
        remote: bool,
    ) -> Option<PublishTicket> {
        let origin = if remote {
            DeliveryOrigin::Remote
        } else {
            DeliveryOrigin::Local
        };
        self.broadcaster
            .broadcast(self.namespace(), &packet, &options, origin);

        if remote {
            return None;
        }

        let (reply, rx) = oneshot::channel();
        let request = PublishRequest {
            packet,
            options,
            reply,
        };
        if self.queue.send(request).is_err() {
            debug!(namespace = %self.namespace(), "Publish queue closed, event stays local");
        }
        Some(PublishTicket { reply: rx })
    }
}

/// Relay adapter bound to one namespace.
///
/// Must be created inside a tokio runtime; it spawns its initialization and
/// publish tasks immediately. Dropping the adapter stops both.
pub struct RelayAdapter {
    inner: Arc<AdapterInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayAdapter {
    pub(crate) fn start(
        namespace: &str,
        origin: OriginId,
        store: Arc<dyn LogStore>,
        publisher: impl FnOnce(&str) -> Publisher,
        broadcaster: Arc<dyn LocalBroadcaster>,
    ) -> Self {
        let router = NamespaceRouter::new(namespace);
        let publisher = publisher(router.namespace());
        let (queue, requests) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(AdapterState::Created);
        let (readiness, _) = watch::channel(None);

        let inner = Arc::new(AdapterInner {
            errors: ErrorSink::new(router.namespace()),
            router,
            origin,
            broadcaster,
            state,
            readiness,
            queue,
        });

        let driver = tokio::spawn(drive(Arc::clone(&inner), store));
        let worker = tokio::spawn(publish_worker(Arc::clone(&inner), publisher, requests));

        Self {
            inner,
            tasks: Mutex::new(vec![driver, worker]),
        }
    }

    pub fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    pub fn origin(&self) -> &OriginId {
        &self.inner.origin
    }

    pub fn state(&self) -> AdapterState {
        self.inner.state()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<AdapterState> {
        self.inner.state.subscribe()
    }

    /// Observe relay errors: initialization, decode, publish and stream failures.
    pub fn errors(&self) -> broadcast::Receiver<Arc<RelayError>> {
        self.inner.errors.subscribe()
    }

    /// Wait until cross-process relay is active.
    ///
    /// Resolves once: `Ok` when the subscription is open, or the error that
    /// stopped initialization.
    pub async fn ready(&self) -> Result<(), Arc<RelayError>> {
        self.inner.wait_ready().await
    }

    /// Deliver an event to local subscribers and, for local events, relay it.
    ///
    /// Local delivery happens before this returns, whatever the adapter
    /// state. Events received from the relay (`remote == true`) are never
    /// published again. Relay failures for local events go to `errors`; the
    /// returned ticket reports the same outcome to callers that want it.
    pub fn broadcast(
        &self,
        packet: Payload,
        options: DeliveryOptions,
        remote: bool,
    ) -> Option<PublishTicket> {
        self.inner.broadcast(packet, options, remote)
    }

    /// Stop relaying. Local delivery keeps working.
    pub fn close(&self) {
        if self.inner.transition(AdapterState::Closed) {
            self.inner
                .resolve(Err(Arc::new(RelayError::NotReady(AdapterState::Closed))));
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for RelayAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Initialize the adapter, then consume the change stream for its lifetime.
async fn drive(inner: Arc<AdapterInner>, store: Arc<dyn LogStore>) {
    if !inner.transition(AdapterState::Connecting) {
        return;
    }

    let subscriber = match initialize(&inner, store.as_ref()).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            inner.fail(RelayError::Initialization(e));
            return;
        }
    };

    if !inner.transition(AdapterState::Ready) {
        return;
    }
    inner.resolve(Ok(()));

    let relay = Arc::clone(&inner);
    let reason = subscriber
        .run(&inner.errors, move |inbound| {
            relay.broadcast(inbound.packet, inbound.options, true);
        })
        .await;

    if inner.state() != AdapterState::Closed {
        inner.fail(reason);
    }
}

async fn initialize(
    inner: &AdapterInner,
    store: &dyn LogStore,
) -> Result<RelaySubscriber, StoreError> {
    store.init().await?;
    RelaySubscriber::open(store, inner.origin.clone(), inner.router.clone()).await
}

/// Publish queued local broadcasts one at a time, in call order.
async fn publish_worker(
    inner: Arc<AdapterInner>,
    publisher: Publisher,
    mut requests: mpsc::UnboundedReceiver<PublishRequest>,
) {
    let readiness = inner.wait_ready().await;

    while let Some(request) = requests.recv().await {
        let state = inner.state();
        let reply = match &readiness {
            Ok(()) if state == AdapterState::Ready => publisher
                .publish(&request.packet, &request.options)
                .await
                .map_err(|e| inner.errors.emit(e)),
            _ => Err(Arc::new(RelayError::NotReady(state))),
        };
        // The caller may have dropped its ticket.
        let _ = request.reply.send(reply);
    }
}

#[cfg(test)]
mod tests;
