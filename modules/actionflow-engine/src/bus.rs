//! Action bus: the single ordered sequence of dispatched actions.
//!
//! Observers are called synchronously from `publish`, in subscription order.
//! Typed streams receive matching actions through an unbounded channel and
//! are pruned as soon as their receiving end is dropped.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use actionflow_events::{Action, Pattern};
use futures::Stream;
use tokio::sync::mpsc;

use crate::lock;

pub(crate) type Observer = Arc<dyn Fn(&Action) + Send + Sync>;

enum Sink {
    Observer(Observer),
    Stream {
        pattern: Pattern,
        tx: mpsc::UnboundedSender<Action>,
    },
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

#[derive(Default)]
pub(crate) struct ActionBus {
    next_subscriber: AtomicU64,
    published: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl ActionBus {
    /// Deliver to every current subscriber. Returns the action's position in
    /// the bus sequence, starting at 1.
    pub fn publish(&self, action: &Action) -> u64 {
        let seq = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot: Vec<_> = lock(&self.subscribers).clone();

        let mut closed = Vec::new();
        for subscriber in &snapshot {
            match &subscriber.sink {
                Sink::Observer(observer) => observer(action),
                Sink::Stream { pattern, tx } => {
                    if pattern.matches(action) && tx.send(action.clone()).is_err() {
                        closed.push(subscriber.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            lock(&self.subscribers).retain(|s| !closed.contains(&s.id));
        }
        seq
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn subscribe(self: &Arc<Self>, observer: Observer) -> Subscription {
        let id = self.add(Sink::Observer(observer));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub fn stream(&self, pattern: Pattern) -> ActionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Sink::Stream { pattern, tx });
        ActionStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|s| match &s.sink {
                Sink::Observer(_) => true,
                Sink::Stream { tx, .. } => !tx.is_closed(),
            })
            .count()
    }

    fn add(&self, sink: Sink) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|s| match &s.sink {
            Sink::Observer(_) => true,
            Sink::Stream { tx, .. } => !tx.is_closed(),
        });
        subscribers.push(Arc::new(Subscriber { id, sink }));
        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() < before
    }
}

/// Observer registration on the bus. Disposed explicitly.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<ActionBus>,
}

impl Subscription {
    /// Detach the observer. Returns `false` if it was already detached.
    pub fn unsubscribe(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.remove(self.id))
    }
}

/// Infinite stream of actions matching a pattern, starting from the moment it
/// was created. Each call to `actions_of_type` yields an independent stream.
#[derive(Debug)]
pub struct ActionStream {
    rx: mpsc::UnboundedReceiver<Action>,
}

impl Stream for ActionStream {
    type Item = Action;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
