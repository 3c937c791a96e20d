//! Per-order event fan-out.
//!
//! Writers take the order's [`OrderTurn`] before committing a change and keep
//! it until the resulting event is published, so an order's events carry
//! strictly increasing sequence numbers in commit order. Each subscriber owns
//! a bounded queue and sees the order's events in that sequence. A subscriber
//! whose queue is full is evicted rather than allowed to slow the publisher;
//! it must reload history from the store and subscribe again.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::models::event::OrderEvent;
use crate::observability::metrics::Metrics;

#[derive(Clone)]
pub struct EventFanout {
    inner: Arc<FanoutInner>,
}

struct FanoutInner {
    topics: DashMap<Uuid, Vec<Subscriber>>,
    sequences: DashMap<Uuid, u64>,
    turns: DashMap<Uuid, Arc<Mutex<()>>>,
    next_subscriber_id: AtomicU64,
    buffer_size: usize,
    metrics: Metrics,
}

struct Subscriber {
    id: u64,
    party_id: Uuid,
    tx: mpsc::Sender<OrderEvent>,
    evicted: Arc<AtomicBool>,
}

impl EventFanout {
    pub fn new(buffer_size: usize, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                topics: DashMap::new(),
                sequences: DashMap::new(),
                turns: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                metrics,
            }),
        }
    }

    /// Waits until no other writer holds `order_id`'s event stream and
    /// claims it. Turns on different orders never wait on each other.
    pub async fn begin(&self, order_id: Uuid) -> OrderTurn {
        let gate = self.inner.turns.entry(order_id).or_default().clone();
        let guard = gate.lock_owned().await;

        OrderTurn {
            inner: self.inner.clone(),
            order_id,
            guard: Some(guard),
        }
    }

    /// Delivers an already sequenced event. Returns how many subscribers
    /// accepted it.
    pub async fn publish(&self, order_id: Uuid, event: OrderEvent) -> usize {
        self.begin(order_id).await.publish(event)
    }

    pub fn subscribe(&self, order_id: Uuid, party_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let evicted = Arc::new(AtomicBool::new(false));

        self.inner
            .topics
            .entry(order_id)
            .or_default()
            .push(Subscriber {
                id,
                party_id,
                tx,
                evicted: evicted.clone(),
            });
        self.inner.metrics.active_subscriptions.inc();

        debug!(order_id = %order_id, party_id = %party_id, subscriber = id, "subscribed");

        Subscription {
            id,
            order_id,
            party_id,
            events: ReceiverStream::new(rx),
            evicted,
            fanout: Arc::downgrade(&self.inner),
            cancelled: false,
        }
    }

    pub fn subscriber_count(&self, order_id: Uuid) -> usize {
        self.inner
            .topics
            .get(&order_id)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl FanoutInner {
    fn next_sequence(&self, order_id: Uuid) -> u64 {
        let mut counter = self.sequences.entry(order_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Hands `event` to every live subscriber of `order_id` without waiting
    /// on any of them.
    fn deliver(&self, order_id: Uuid, event: OrderEvent) -> usize {
        let Some(mut subscribers) = self.topics.get_mut(&order_id) else {
            trace!(order_id = %order_id, "no subscribers for event");
            return 0;
        };

        let metrics = &self.metrics;
        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    order_id = %order_id,
                    party_id = %subscriber.party_id,
                    subscriber = subscriber.id,
                    "evicting subscriber that fell behind"
                );
                subscriber.evicted.store(true, Ordering::Release);
                metrics.evicted_subscribers_total.inc();
                metrics.active_subscriptions.dec();
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics.active_subscriptions.dec();
                false
            }
        });

        let now_empty = subscribers.is_empty();
        drop(subscribers);
        if now_empty {
            self.topics
                .remove_if(&order_id, |_, subscribers| subscribers.is_empty());
        }

        delivered
    }

    fn detach(&self, order_id: Uuid, subscriber_id: u64) {
        let Some(mut subscribers) = self.topics.get_mut(&order_id) else {
            return;
        };

        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != subscriber_id);
        if subscribers.len() < before {
            self.metrics.active_subscriptions.dec();
        }

        let now_empty = subscribers.is_empty();
        drop(subscribers);
        if now_empty {
            self.topics
                .remove_if(&order_id, |_, subscribers| subscribers.is_empty());
        }
    }
}

/// Exclusive write access to one order's event stream. Sequence numbers
/// come only from a turn and the turn publishes what it sequenced, so no
/// event can overtake another on the same order. Dropping the turn lets the
/// next writer in.
pub struct OrderTurn {
    inner: Arc<FanoutInner>,
    order_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl OrderTurn {
    /// Next value of the order's event sequence, starting at 1.
    pub fn next_sequence(&mut self) -> u64 {
        self.inner.next_sequence(self.order_id)
    }

    pub fn publish(&mut self, event: OrderEvent) -> usize {
        self.inner.deliver(self.order_id, event)
    }
}

impl Drop for OrderTurn {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.inner
            .turns
            .remove_if(&self.order_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// A live, non-restartable stream of one order's events. Dropping it
/// cancels it.
pub struct Subscription {
    id: u64,
    order_id: Uuid,
    party_id: Uuid,
    events: ReceiverStream<OrderEvent>,
    evicted: Arc<AtomicBool>,
    fanout: Weak<FanoutInner>,
    cancelled: bool,
}

impl Subscription {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    pub fn party_id(&self) -> Uuid {
        self.party_id
    }

    /// Next event, or `None` once cancelled, evicted or shut down.
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        if self.cancelled {
            return None;
        }
        self.events.next().await
    }

    /// True when the fan-out dropped this subscriber for falling behind.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Detaches immediately. Calling it again does nothing.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.events.close();

        if let Some(fanout) = self.fanout.upgrade() {
            fanout.detach(self.order_id, self.id);
        }
        debug!(order_id = %self.order_id, party_id = %self.party_id, subscriber = self.id, "unsubscribed");
    }
}

impl Stream for Subscription {
    type Item = OrderEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::EventFanout;
    use crate::models::chat::ChatMessage;
    use crate::models::event::OrderEvent;
    use crate::observability::metrics::Metrics;

    fn chat(order_id: Uuid, sequence: u64, text: &str) -> OrderEvent {
        OrderEvent::ChatMessage(ChatMessage {
            id: Uuid::new_v4(),
            order_id,
            sender_id: Uuid::nil(),
            receiver_id: Uuid::nil(),
            message: text.to_string(),
            sequence,
            created_at: Utc::now(),
        })
    }

    fn text(event: Option<OrderEvent>) -> String {
        match event {
            Some(OrderEvent::ChatMessage(message)) => message.message,
            other => panic!("expected chat message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_publish_order() {
        let fanout = EventFanout::new(16, Metrics::new());
        let order_id = Uuid::new_v4();
        let mut customer = fanout.subscribe(order_id, Uuid::new_v4());
        let mut driver = fanout.subscribe(order_id, Uuid::new_v4());

        assert_eq!(fanout.publish(order_id, chat(order_id, 1, "A")).await, 2);
        assert_eq!(fanout.publish(order_id, chat(order_id, 2, "B")).await, 2);

        for subscription in [&mut customer, &mut driver] {
            assert_eq!(text(subscription.recv().await), "A");
            assert_eq!(text(subscription.recv().await), "B");
        }
    }

    #[tokio::test]
    async fn events_stay_within_their_order() {
        let fanout = EventFanout::new(16, Metrics::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut subscription = fanout.subscribe(first, Uuid::new_v4());

        assert_eq!(fanout.publish(second, chat(second, 1, "elsewhere")).await, 0);
        fanout.publish(first, chat(first, 1, "here")).await;

        assert_eq!(text(subscription.recv().await), "here");
    }

    #[tokio::test]
    async fn cancel_releases_the_slot_and_is_idempotent() {
        let metrics = Metrics::new();
        let fanout = EventFanout::new(16, metrics.clone());
        let order_id = Uuid::new_v4();
        let mut subscription = fanout.subscribe(order_id, Uuid::new_v4());
        assert_eq!(fanout.subscriber_count(order_id), 1);
        assert_eq!(metrics.active_subscriptions.get(), 1);

        subscription.cancel();
        subscription.cancel();

        assert_eq!(fanout.subscriber_count(order_id), 0);
        assert_eq!(metrics.active_subscriptions.get(), 0);
        assert!(subscription.recv().await.is_none());
        assert_eq!(fanout.publish(order_id, chat(order_id, 1, "late")).await, 0);
    }

    #[tokio::test]
    async fn dropping_a_subscription_detaches_it() {
        let fanout = EventFanout::new(16, Metrics::new());
        let order_id = Uuid::new_v4();
        {
            let _subscription = fanout.subscribe(order_id, Uuid::new_v4());
            assert_eq!(fanout.subscriber_count(order_id), 1);
        }
        assert_eq!(fanout.subscriber_count(order_id), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_blocking_others() {
        let metrics = Metrics::new();
        let fanout = EventFanout::new(2, metrics.clone());
        let order_id = Uuid::new_v4();
        let mut slow = fanout.subscribe(order_id, Uuid::new_v4());
        let mut fast = fanout.subscribe(order_id, Uuid::new_v4());

        for (sequence, body) in ["1", "2"].into_iter().enumerate() {
            fanout.publish(order_id, chat(order_id, sequence as u64 + 1, body)).await;
            assert_eq!(text(fast.recv().await), body);
        }

        assert_eq!(fanout.publish(order_id, chat(order_id, 3, "3")).await, 1);
        assert_eq!(text(fast.recv().await), "3");

        assert!(slow.is_evicted());
        assert_eq!(metrics.evicted_subscribers_total.get(), 1);
        assert_eq!(fanout.subscriber_count(order_id), 1);

        assert_eq!(text(slow.recv().await), "1");
        assert_eq!(text(slow.recv().await), "2");
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn sequences_are_per_order() {
        let fanout = EventFanout::new(4, Metrics::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut turn = fanout.begin(a).await;
        assert_eq!(turn.next_sequence(), 1);
        assert_eq!(turn.next_sequence(), 2);
        drop(turn);

        assert_eq!(fanout.begin(b).await.next_sequence(), 1);
        assert_eq!(fanout.begin(a).await.next_sequence(), 3);
    }

    #[tokio::test]
    async fn a_second_writer_waits_for_the_turn() {
        let fanout = EventFanout::new(4, Metrics::new());
        let order_id = Uuid::new_v4();
        let other_order = Uuid::new_v4();

        let held = fanout.begin(order_id).await;
        let waiting = tokio::time::timeout(Duration::from_millis(50), fanout.begin(order_id)).await;
        assert!(waiting.is_err());

        let elsewhere = tokio::time::timeout(Duration::from_millis(50), fanout.begin(other_order)).await;
        assert!(elsewhere.is_ok());

        drop(held);
        let mut next = fanout.begin(order_id).await;
        assert_eq!(next.next_sequence(), 1);
    }

    #[tokio::test]
    async fn released_turns_are_forgotten() {
        let fanout = EventFanout::new(4, Metrics::new());
        let order_id = Uuid::new_v4();

        drop(fanout.begin(order_id).await);
        assert!(fanout.inner.turns.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_publish_in_sequence_order() {
        let fanout = EventFanout::new(256, Metrics::new());
        let order_id = Uuid::new_v4();
        let mut first = fanout.subscribe(order_id, Uuid::new_v4());
        let mut second = fanout.subscribe(order_id, Uuid::new_v4());

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let fanout = fanout.clone();
                tokio::spawn(async move {
                    for n in 0..16 {
                        let mut turn = fanout.begin(order_id).await;
                        let sequence = turn.next_sequence();
                        tokio::task::yield_now().await;
                        turn.publish(chat(order_id, sequence, &format!("{writer}-{n}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        for subscription in [&mut first, &mut second] {
            let mut last = 0;
            for _ in 0..128 {
                let event = subscription.recv().await.unwrap();
                assert!(event.sequence() > last, "{} after {last}", event.sequence());
                last = event.sequence();
            }
        }
    }
}
