//! In-process publish/subscribe bus for state-transition notifications.
//!
//! Every subscriber registration records where its events are delivered:
//!
//! * **Inline** (`on`) – the callback runs synchronously on the publishing
//!   task, which for stream events is the stream's own background task.
//!   Callbacks must be short and must not block.
//! * **Hand-off** (`subscribe`) – the event is queued on a
//!   [`tokio::sync::broadcast`] channel and picked up by whichever task owns
//!   the [`TopicReceiver`].
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Lifecycle`] | Stream started / ended |
//! | [`Topic::Control`] | Control granted / lost / released |
//! | [`Topic::Actions`] | Action started / finished |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use botlink_types::LinkEvent;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow hand-off subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lifecycle,
    Control,
    Actions,
}

/// Identifies an inline registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type InlineCallback = Arc<dyn Fn(&LinkEvent) + Send + Sync>;

struct InlineSubscriber {
    id: SubscriptionId,
    topic: Topic,
    callback: InlineCallback,
}

struct BusInner {
    lifecycle: broadcast::Sender<LinkEvent>,
    control: broadcast::Sender<LinkEvent>,
    actions: broadcast::Sender<LinkEvent>,
    inline: Mutex<Vec<InlineSubscriber>>,
    next_id: AtomicU64,
}

/// Shared event bus. Clone it cheaply – all clones share the same channels
/// and the same inline registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("inline_subscribers", &self.inner.inline.lock().len())
            .finish()
    }
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic channel.
    pub fn new(capacity: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(capacity);
        let (control, _) = broadcast::channel(capacity);
        let (actions, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                lifecycle,
                control,
                actions,
                inline: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Inline callbacks run first, in registration order, on the caller's
    /// task.  Returns the total number of subscribers the event reached.
    /// Zero is a normal outcome, not an error.
    pub fn publish(&self, topic: Topic, event: LinkEvent) -> usize {
        // Snapshot so a callback may (un)register without deadlocking.
        let callbacks: Vec<InlineCallback> = self
            .inner
            .inline
            .lock()
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in &callbacks {
            callback(&event);
        }
        let handed_off = self.topic_sender(topic).send(event).unwrap_or(0);
        callbacks.len() + handed_off
    }

    /// Register an inline callback on `topic`.
    pub fn on<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.inline.lock().push(InlineSubscriber {
            id,
            topic,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove an inline callback.  Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inline = self.inner.inline.lock();
        let before = inline.len();
        inline.retain(|s| s.id != id);
        inline.len() != before
    }

    /// Hand-off subscription to `topic`.
    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<LinkEvent> {
        match topic {
            Topic::Lifecycle => &self.inner.lifecycle,
            Topic::Control => &self.inner.control,
            Topic::Actions => &self.inner.actions,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`].
///
/// Obtained via [`EventBus::subscribe`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<LinkEvent>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// A lagging receiver logs the number of dropped events and keeps going.
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_types::{LinkEventPayload, Priority};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn granted() -> LinkEvent {
        LinkEvent::new(
            "botlink-middleware::test",
            LinkEventPayload::ControlGranted {
                priority: Priority::Default,
            },
        )
    }

    #[tokio::test]
    async fn hand_off_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe(Topic::Control);
        let mut rx2 = bus.subscribe(Topic::Control);

        let event = granted();
        assert_eq!(bus.publish(Topic::Control, event.clone()), 2);

        assert_eq!(rx1.recv().await.ok_or("rx1 closed")?.id, event.id);
        assert_eq!(rx2.recv().await.ok_or("rx2 closed")?.id, event.id);
        Ok(())
    }

    #[test]
    fn inline_callback_runs_on_publisher() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        bus.on(Topic::Control, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Already incremented by the time publish returns.
        assert_eq!(bus.publish(Topic::Control, granted()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inline_callback_only_sees_its_topic() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        bus.on(Topic::Lifecycle, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Topic::Control, granted());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_inline_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let id = bus.on(Topic::Actions, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(Topic::Actions, granted());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_register_while_publishing() {
        let bus = EventBus::default();
        let inner_bus = bus.clone();
        bus.on(Topic::Control, move |_| {
            inner_bus.on(Topic::Control, |_| {});
        });
        // Must not deadlock on the registry lock.
        bus.publish(Topic::Control, granted());
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(Topic::Lifecycle, granted()), 0);
    }

    #[tokio::test]
    async fn other_topics_are_isolated() {
        let bus = EventBus::default();
        let mut lifecycle = bus.subscribe(Topic::Lifecycle);
        bus.publish(Topic::Control, granted());

        let result = tokio::time::timeout(Duration::from_millis(50), lifecycle.recv()).await;
        assert!(result.is_err(), "lifecycle receiver must not see control events");
    }

    #[tokio::test]
    async fn slow_receiver_skips_lagged_events() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe(Topic::Actions);
        for _ in 0..32 {
            bus.publish(Topic::Actions, granted());
        }
        // Lag is logged and swallowed; the newest events are still readable.
        assert!(slow.recv().await.is_some());
    }
}
