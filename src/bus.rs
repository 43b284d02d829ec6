//! Fan-out of accepted updates to subscribers.
//!
//! Each subscriber owns an unbounded queue drained by a dedicated task, so
//! a slow or panicking callback never blocks publishers or sibling
//! subscribers. Publishing only enqueues; the callback runs on the
//! subscriber's own task.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type SubscriberMap<T> = HashMap<u64, mpsc::UnboundedSender<T>>;

/// An observer list with per-subscriber buffered delivery.
pub struct ObserverSet<T> {
    subscribers: Arc<Mutex<SubscriberMap<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + 'static> ObserverSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback and spawns its drain task. Requires a running
    /// tokio runtime.
    ///
    /// The returned [`Subscription`] cancels on drop; after `cancel()`
    /// returns, the callback is guaranteed not to run again.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let cancelled = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Mutex::new(()));

        let task_cancelled = cancelled.clone();
        let task_gate = gate.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let _slot = task_gate.lock().unwrap_or_else(PoisonError::into_inner);
                if task_cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                    tracing::warn!("subscriber callback panicked; subscription kept");
                }
            }
        });

        let subscribers = self.subscribers.clone();
        Subscription {
            cancelled,
            gate,
            detach: Some(Box::new(move || {
                subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            })),
        }
    }

    /// Enqueues `update` for every current subscriber, in subscription
    /// order per subscriber. Non-blocking; subscribers whose drain task is
    /// gone are pruned.
    pub fn publish(&self, update: &T) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|_, tx| tx.send(update.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Cancellation handle for one subscription.
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Stops delivery. Synchronous and race-free: waits out a callback
    /// invocation that is already in flight, so once this returns the
    /// callback will not run again. Must not be called from inside the
    /// subscription's own callback.
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        if let Some(detach) = self.detach.take() {
            self.cancelled.store(true, Ordering::SeqCst);
            detach();
            drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn delivers_updates_in_publish_order() {
        let bus = ObserverSet::<u32>::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe(move |n: &u32| {
            let _ = tx.send(*n);
        });

        for n in 0..5 {
            bus.publish(&n);
        }
        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let bus = ObserverSet::<u32>::new();
        let _bad = bus.subscribe(|_: &u32| panic!("boom"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _good = bus.subscribe(move |n: &u32| {
            let _ = tx.send(*n);
        });

        bus.publish(&1);
        bus.publish(&2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        // The panicking subscriber stays registered.
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let bus = ObserverSet::<u32>::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe(move |n: &u32| {
            let _ = tx.send(*n);
        });

        bus.publish(&1);
        assert_eq!(rx.recv().await, Some(1));

        sub.cancel();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(&2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_waits_out_an_in_flight_callback() {
        let bus = ObserverSet::<u32>::new();
        let entered = Arc::new(tokio::sync::Notify::new());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let calls = Arc::new(AtomicU64::new(0));

        let sub = {
            let entered = entered.clone();
            let calls = calls.clone();
            bus.subscribe(move |_: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                entered.notify_one();
                // Block until the test releases us.
                let _ = release_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
            })
        };

        bus.publish(&1);
        bus.publish(&2);
        entered.notified().await;

        // Cancel from a blocking thread while the callback is stuck, then
        // let the callback finish.
        let cancel = tokio::task::spawn_blocking(move || sub.cancel());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        release_tx.send(()).unwrap();
        cancel.await.unwrap();

        // The queued second update must never be delivered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_subscription_unsubscribes() {
        let bus = ObserverSet::<u32>::new();
        {
            let _sub = bus.subscribe(|_: &u32| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
