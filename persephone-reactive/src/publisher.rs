//! Broadcasting publisher.
//!
//! A [`Publisher`] hands every broadcast element to all currently attached
//! [`Subscription`]s. The producer is never suspended: when nobody is
//! listening, or when any listener's buffer is full, the element is dropped
//! and [`Publisher::broadcast`] reports `false`.
//!
//! The number of attached subscriptions is owned by a dedicated counter task
//! fed with increment/decrement signals, so producers can hold off until the
//! stream turns hot via [`Publisher::wait_for_subscription`].

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// The publisher was closed before the awaited condition was met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("publisher closed")]
pub struct PublisherClosed;

/// Input to the subscriber counter task.
#[derive(Debug, Clone, Copy)]
enum CounterSignal {
    Increment,
    Decrement,
}

struct State<T, E> {
    closed: bool,
    /// Terminal error handed to every subscription after its buffer drains.
    error: Option<E>,
    sinks: Vec<mpsc::Sender<T>>,
    /// Strong handle to the counter task. Dropping it stops the task.
    counter: Option<mpsc::UnboundedSender<CounterSignal>>,
}

struct Shared<T, E> {
    capacity: usize,
    state: Mutex<State<T, E>>,
    count: watch::Receiver<usize>,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hot, multi-subscriber event stream of `T` that terminates with an optional
/// error `E`.
pub struct Publisher<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Publisher<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a publisher whose subscribers each buffer up to `capacity`
    /// outstanding elements.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (counter_tx, counter_rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0);
        tokio::spawn(run_counter(counter_rx, count_tx));

        Self {
            shared: Arc::new(Shared {
                capacity: capacity.max(1),
                state: Mutex::new(State {
                    closed: false,
                    error: None,
                    sinks: Vec::new(),
                    counter: Some(counter_tx),
                }),
                count: count_rx,
            }),
        }
    }

    /// Attach a new subscriber.
    ///
    /// Subscribing to a closed publisher yields a subscription that ends
    /// immediately, carrying the close error if there was one.
    pub fn subscribe(&self) -> Subscription<T, E> {
        let (tx, rx) = mpsc::channel(self.shared.capacity);

        let mut state = self.shared.lock();
        let counter = if state.closed {
            None
        } else {
            state.counter.clone()
        };
        let counter = counter.map(|counter| {
            // A closed counter only means a racing close; nothing to report.
            let _ = counter.send(CounterSignal::Increment);
            counter.downgrade()
        });
        if counter.is_some() {
            state.sinks.push(tx);
        }
        drop(state);

        Subscription {
            rx,
            shared: Arc::clone(&self.shared),
            counter,
            finished: false,
        }
    }

    /// Offer `element` to every attached subscriber without waiting.
    ///
    /// Returns `false` if the publisher is closed, has no subscribers, or any
    /// subscriber's buffer is full. In that case nobody receives the element.
    pub fn broadcast(&self, element: T) -> bool {
        let mut state = self.shared.lock();
        if state.closed {
            return false;
        }

        state.sinks.retain(|sink| !sink.is_closed());
        if state.sinks.is_empty() || state.sinks.iter().any(|sink| sink.capacity() == 0) {
            return false;
        }

        // Capacity was checked under the lock and consumers can only free
        // slots, so none of these sends can fail with `Full`.
        for sink in &state.sinks {
            let _ = sink.try_send(element.clone());
        }
        true
    }

    /// Resolve once at least `min_count` subscriptions are attached.
    pub async fn wait_for_subscription(&self, min_count: usize) -> Result<(), PublisherClosed> {
        let mut count = self.shared.count.clone();
        count
            .wait_for(|value| *value >= min_count)
            .await
            .map(|_| ())
            .map_err(|_| PublisherClosed)
    }
}

impl<T, E> Publisher<T, E> {
    /// Close the publisher.
    ///
    /// Every subscription receives its remaining buffered elements, then
    /// `error` (if any), then ends. Only the first call has an effect.
    pub fn close(&self, error: Option<E>) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.error = error;
        state.sinks.clear();
        state.counter.take();
        trace!("publisher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Whether any subscription is still attached. Unlike
    /// [`subscriber_count`](Self::subscriber_count) this does not wait for the
    /// counter task to observe dropped subscriptions.
    pub fn has_subscribers(&self) -> bool {
        let mut state = self.shared.lock();
        state.sinks.retain(|sink| !sink.is_closed());
        !state.sinks.is_empty()
    }

    /// Number of currently attached subscriptions, as last reported by the
    /// counter task.
    pub fn subscriber_count(&self) -> usize {
        *self.shared.count.borrow()
    }
}

impl<T, E> Drop for Publisher<T, E> {
    fn drop(&mut self) {
        // No producer can exist past this point.
        self.close(None);
    }
}

impl<T, E> std::fmt::Debug for Publisher<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("capacity", &self.shared.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_counter(
    mut signals: mpsc::UnboundedReceiver<CounterSignal>,
    count: watch::Sender<usize>,
) {
    let mut value: usize = 0;
    while let Some(signal) = signals.recv().await {
        value = match signal {
            CounterSignal::Increment => value + 1,
            CounterSignal::Decrement => value.saturating_sub(1),
        };
        count.send_replace(value);
    }
    trace!("subscriber counter stopped");
}

/// One consumer's view of a [`Publisher`].
///
/// Yields `Ok(element)` for every delivered element and, if the publisher was
/// closed with an error, a final `Err(error)`.
pub struct Subscription<T, E> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared<T, E>>,
    counter: Option<mpsc::WeakUnboundedSender<CounterSignal>>,
    finished: bool,
}

impl<T, E: Clone> Stream for Subscription<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(element)) => Poll::Ready(Some(Ok(element))),
            Poll::Ready(None) => {
                this.finished = true;
                let error = this.shared.lock().error.clone();
                Poll::Ready(error.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for Subscription<T, E> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take().and_then(|weak| weak.upgrade()) {
            let _ = counter.send(CounterSignal::Decrement);
        }
    }
}
