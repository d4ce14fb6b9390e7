use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Fan-out of typed notifications to any number of subscribers.
///
/// A subscriber only sees notifications published after it subscribed and is
/// removed as soon as its [`Subscription`] is dropped.
pub struct Notifier<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

struct Subscribers<T> {
    next_id: u64,
    senders: HashMap<u64, flume::Sender<T>>,
}

pub struct Subscription<T> {
    id: u64,
    rx: flume::Receiver<T>,
    subscribers: Weak<Mutex<Subscribers<T>>>,
}

impl<T: Clone> Notifier<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = flume::unbounded();
        let mut subscribers = lock(&self.inner);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.insert(id, tx);

        Subscription {
            id,
            rx,
            subscribers: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `msg` to every current subscriber.
    pub fn publish(&self, msg: T) {
        let mut subscribers = lock(&self.inner);
        subscribers
            .senders
            .retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).senders.len()
    }
}

impl<T: Clone> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscription<T> {
    /// Next notification, or `None` once the notifier is gone.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).senders.remove(&self.id);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking subscriber cannot leave the map half-updated.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
