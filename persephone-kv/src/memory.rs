//! In-memory store owned by a single task.
//!
//! [`InMemoryKeyValueStore`] is a cheap handle; every operation is sent as a
//! [`Command`] to the owning [`StoreActor`], which serializes them and
//! answers through a oneshot responder. Subscribers are fed through one
//! [`Publisher`] each, so a stalled subscriber never holds up writers: it is
//! cut off with [`StoreError::InterruptedEventStream`] instead.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use persephone_reactive::Publisher;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::store::{Event, EventSubscription, KeyValueStore, SubscriptionId, Versioned};
use crate::version::{MonotonicVersion, Version};

/// Default depth of the request queue in front of the owner task.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

type EventPublisher<K, V, T> = Publisher<Event<K, V, T>, StoreError<T>>;

/// Requests processed by the owner task.
enum Command<K, V, T> {
    Get {
        key: K,
        responder: oneshot::Sender<Versioned<V, T>>,
    },
    Set {
        key: K,
        expected: T,
        value: V,
        responder: oneshot::Sender<Result<Versioned<V, T>, T>>,
    },
    Delete {
        key: K,
        expected: T,
        responder: oneshot::Sender<Result<Versioned<V, T>, T>>,
    },
    Subscribe {
        capacity: usize,
        replay: bool,
        responder: oneshot::Sender<EventSubscription<K, V, T>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        responder: oneshot::Sender<()>,
    },
    Close {
        responder: oneshot::Sender<()>,
    },
}

/// Handle to an in-memory versioned store.
///
/// Clones share the same store. The owner task stops on [`close`] or once
/// every handle is dropped.
///
/// [`close`]: KeyValueStore::close
pub struct InMemoryKeyValueStore<K, V, T = MonotonicVersion> {
    command_tx: mpsc::Sender<Command<K, V, T>>,
}

impl<K, V, T> Clone for InMemoryKeyValueStore<K, V, T> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
        }
    }
}

impl<K, V, T> InMemoryKeyValueStore<K, V, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    T: Version,
{
    /// Spawn the owner task. Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        let (command_tx, command_rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(StoreActor::new(command_rx).run());
        Self { command_tx }
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command<K, V, T>,
    ) -> Result<R, T> {
        let (responder, response) = oneshot::channel();
        self.command_tx
            .send(command(responder))
            .await
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)
    }
}

impl<K, V, T> Default for InMemoryKeyValueStore<K, V, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    T: Version,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V, T> KeyValueStore<K, V, T> for InMemoryKeyValueStore<K, V, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    T: Version,
{
    async fn get(&self, key: K) -> Result<Versioned<V, T>, T> {
        self.request(|responder| Command::Get { key, responder })
            .await
    }

    async fn set(&self, key: K, expected: T, value: V) -> Result<Versioned<V, T>, T> {
        self.request(|responder| Command::Set {
            key,
            expected,
            value,
            responder,
        })
        .await?
    }

    async fn delete(&self, key: K, expected: T) -> Result<Versioned<V, T>, T> {
        self.request(|responder| Command::Delete {
            key,
            expected,
            responder,
        })
        .await?
    }

    async fn subscribe(
        &self,
        capacity: usize,
        replay: bool,
    ) -> Result<EventSubscription<K, V, T>, T> {
        self.request(|responder| Command::Subscribe {
            capacity,
            replay,
            responder,
        })
        .await
    }

    async fn unsubscribe(&self, subscription: &EventSubscription<K, V, T>) -> Result<(), T> {
        let id = subscription.id();
        self.request(|responder| Command::Unsubscribe { id, responder })
            .await
    }

    async fn close(&self) {
        // Closing an already stopped store is a no-op.
        let _ = self.request(|responder| Command::Close { responder }).await;
    }
}

// =============================================================================
// Owner Task
// =============================================================================

struct StoreActor<K, V, T> {
    command_rx: mpsc::Receiver<Command<K, V, T>>,
    entries: BTreeMap<K, (V, T)>,
    sinks: Vec<(SubscriptionId, EventPublisher<K, V, T>)>,
    next_subscription: u64,
}

impl<K, V, T> StoreActor<K, V, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    T: Version,
{
    fn new(command_rx: mpsc::Receiver<Command<K, V, T>>) -> Self {
        Self {
            command_rx,
            entries: BTreeMap::new(),
            sinks: Vec::new(),
            next_subscription: 0,
        }
    }

    async fn run(mut self) {
        debug!("StoreActor: running");

        while let Some(cmd) = self.command_rx.recv().await {
            if let Some(responder) = self.handle_command(cmd) {
                self.shutdown(Some(StoreError::Closed));
                let _ = responder.send(());
                info!("StoreActor: closed");
                return;
            }
        }

        self.shutdown(None);
        debug!("StoreActor: all handles dropped, shutting down");
    }

    /// Process one command. Returns the close responder when the store has
    /// to stop.
    fn handle_command(&mut self, cmd: Command<K, V, T>) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Get { key, responder } => {
                let _ = responder.send(self.get(&key));
            }
            Command::Set {
                key,
                expected,
                value,
                responder,
            } => {
                let _ = responder.send(self.set(key, expected, value));
            }
            Command::Delete {
                key,
                expected,
                responder,
            } => {
                let _ = responder.send(self.delete(key, expected));
            }
            Command::Subscribe {
                capacity,
                replay,
                responder,
            } => {
                let subscription = self.subscribe(capacity, replay);
                if responder.send(subscription).is_err() {
                    // Caller went away; its sink is pruned on the next event.
                    debug!("StoreActor: subscriber left before receiving its subscription");
                }
            }
            Command::Unsubscribe { id, responder } => {
                self.unsubscribe(id);
                let _ = responder.send(());
            }
            Command::Close { responder } => return Some(responder),
        }
        None
    }

    fn get(&self, key: &K) -> Versioned<V, T> {
        match self.entries.get(key) {
            Some((value, version)) => Versioned::Just {
                value: value.clone(),
                version: version.clone(),
            },
            None => Versioned::None,
        }
    }

    fn current_version(&self, key: &K) -> T {
        self.entries
            .get(key)
            .map(|(_, version)| version.clone())
            .unwrap_or_else(T::initial)
    }

    fn set(&mut self, key: K, expected: T, value: V) -> Result<Versioned<V, T>, T> {
        let actual = self.current_version(&key);
        if actual != expected {
            debug!(?key, %expected, %actual, "StoreActor: rejected stale set");
            return Err(StoreError::VersionMismatch { expected, actual });
        }

        let version = expected.next();
        let previous = self
            .entries
            .insert(key.clone(), (value.clone(), version.clone()));
        self.publish(Event::Change {
            key,
            value,
            version,
        });

        Ok(match previous {
            Some((value, version)) => Versioned::Just { value, version },
            None => Versioned::None,
        })
    }

    fn delete(&mut self, key: K, expected: T) -> Result<Versioned<V, T>, T> {
        let actual = self.current_version(&key);
        if actual != expected {
            debug!(?key, %expected, %actual, "StoreActor: rejected stale delete");
            return Err(StoreError::VersionMismatch { expected, actual });
        }

        match self.entries.remove(&key) {
            Some((value, version)) => {
                self.publish(Event::Delete {
                    key,
                    last_version: version.clone(),
                });
                Ok(Versioned::Just { value, version })
            }
            None => Ok(Versioned::None),
        }
    }

    fn subscribe(&mut self, capacity: usize, replay: bool) -> EventSubscription<K, V, T> {
        let replayed: Vec<_> = if replay {
            self.entries
                .iter()
                .map(|(key, (value, version))| Event::Change {
                    key: key.clone(),
                    value: value.clone(),
                    version: version.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        // Room for the replayed prefix on top of the live buffer.
        let sink = Publisher::new(capacity.max(1) + replayed.len());
        let subscription = sink.subscribe();
        for event in replayed {
            sink.broadcast(event);
        }

        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.sinks.push((id, sink));
        debug!(?id, replay, "StoreActor: subscriber registered");

        EventSubscription { id, subscription }
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(index) = self.sinks.iter().position(|(sink_id, _)| *sink_id == id) {
            let (_, sink) = self.sinks.swap_remove(index);
            sink.close(None);
            debug!(?id, "StoreActor: subscriber removed");
        }
    }

    fn publish(&mut self, event: Event<K, V, T>) {
        self.sinks.retain(|(id, sink)| {
            if sink.broadcast(event.clone()) {
                return true;
            }
            if sink.has_subscribers() {
                warn!(?id, "StoreActor: subscriber fell behind, interrupting its stream");
                sink.close(Some(StoreError::InterruptedEventStream));
            } else {
                debug!(?id, "StoreActor: subscriber departed");
                sink.close(None);
            }
            false
        });
    }

    fn shutdown(&mut self, error: Option<StoreError<T>>) {
        for (_, sink) in self.sinks.drain(..) {
            sink.close(error.clone());
        }
    }
}
