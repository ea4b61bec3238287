//! KeyValueStore trait and the value types it traffics in.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use persephone_reactive::Subscription;

use crate::error::{Result, StoreError};
use crate::version::Version;

// =============================================================================
// Values
// =============================================================================

/// A value together with the version it was written at, or the absence of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Versioned<V, T> {
    Just { value: V, version: T },
    None,
}

impl<V, T> Versioned<V, T> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Versioned::Just { value, .. } => Some(value),
            Versioned::None => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Versioned::Just { value, .. } => Some(value),
            Versioned::None => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Versioned::None)
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Versioned<U, T> {
        match self {
            Versioned::Just { value, version } => Versioned::Just {
                value: f(value),
                version,
            },
            Versioned::None => Versioned::None,
        }
    }
}

impl<V, T: Version> Versioned<V, T> {
    /// The version a CAS write against this entry has to present.
    ///
    /// Absent entries report the initial version.
    pub fn version(&self) -> T {
        match self {
            Versioned::Just { version, .. } => version.clone(),
            Versioned::None => T::initial(),
        }
    }
}

/// Mutation notification delivered to store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<K, V, T> {
    /// `key` now holds `value` at `version`.
    Change { key: K, value: V, version: T },
    /// `key` was removed; it was at `last_version` before.
    Delete { key: K, last_version: T },
}

impl<K, V, T> Event<K, V, T> {
    pub fn key(&self) -> &K {
        match self {
            Event::Change { key, .. } | Event::Delete { key, .. } => key,
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Identifies one subscription within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Event feed of one subscriber.
///
/// Ends when the subscriber unsubscribes or the store closes, and ends with
/// [`StoreError::InterruptedEventStream`] if the subscriber fell behind.
pub struct EventSubscription<K, V, T> {
    pub(crate) id: SubscriptionId,
    pub(crate) subscription: Subscription<Event<K, V, T>, StoreError<T>>,
}

impl<K, V, T> EventSubscription<K, V, T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<K, V, T: Clone> Stream for EventSubscription<K, V, T> {
    type Item = std::result::Result<Event<K, V, T>, StoreError<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().subscription).poll_next(cx)
    }
}

impl<K, V, T> std::fmt::Debug for EventSubscription<K, V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .finish()
    }
}

// =============================================================================
// KeyValueStore Trait
// =============================================================================

/// Versioned key-value store with compare-and-set writes.
///
/// A write is accepted only if `expected` equals the version currently stored
/// for the key (the initial version for absent keys). Accepted writes store
/// the value at `expected.next()`.
#[async_trait]
pub trait KeyValueStore<K, V, T>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    T: Version,
{
    /// Current value of `key`.
    async fn get(&self, key: K) -> Result<Versioned<V, T>, T>;

    /// Write `value` to `key` if it is at `expected`. Returns the previous value.
    async fn set(&self, key: K, expected: T, value: V) -> Result<Versioned<V, T>, T>;

    /// Remove `key` if it is at `expected`. Returns the removed value.
    async fn delete(&self, key: K, expected: T) -> Result<Versioned<V, T>, T>;

    /// Register an event subscriber buffering up to `capacity` live events.
    ///
    /// With `replay`, one `Change` per live key is delivered before any live
    /// event.
    async fn subscribe(&self, capacity: usize, replay: bool)
    -> Result<EventSubscription<K, V, T>, T>;

    /// Close and forget a subscription. Unknown subscriptions are ignored.
    async fn unsubscribe(&self, subscription: &EventSubscription<K, V, T>) -> Result<(), T>;

    /// Stop the store. Later operations fail with [`StoreError::Closed`].
    async fn close(&self);
}
