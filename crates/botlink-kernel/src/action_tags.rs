//! [`ActionTagAllocator`] – correlation tags and single-flight actions.
//!
//! The device runs at most one SDK-issued action at a time, and the
//! allocator enforces the same rule locally: starting an action first
//! cancels the active one and waits until its result has settled.  With only
//! one tag ever in flight, wrapping the counter back to the start of the
//! range can never collide.

use std::sync::Arc;

use botlink_middleware::{ActionChannel, EventBus, Topic};
use botlink_types::{
    ActionRequest, ActionStatus, ActionTag, FIRST_SDK_TAG, LAST_SDK_TAG, LinkError, LinkEvent,
    LinkEventPayload,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

const SOURCE: &str = "botlink-kernel::actions";

/// Inclusive range the allocator draws tags from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRange {
    first: ActionTag,
    last: ActionTag,
}

impl TagRange {
    /// # Errors
    ///
    /// [`LinkError::Config`] when `first > last`.
    pub fn new(first: ActionTag, last: ActionTag) -> Result<Self, LinkError> {
        if first > last {
            return Err(LinkError::Config(format!(
                "empty action tag range {first}..={last}"
            )));
        }
        Ok(Self { first, last })
    }

    /// The sub-range reserved for SDK-originated actions.
    pub const fn sdk() -> Self {
        Self {
            first: FIRST_SDK_TAG,
            last: LAST_SDK_TAG,
        }
    }

    pub fn first(&self) -> ActionTag {
        self.first
    }

    pub fn last(&self) -> ActionTag {
        self.last
    }

    pub fn size(&self) -> u64 {
        u64::from(self.last - self.first) + 1
    }

    pub fn contains(&self, tag: ActionTag) -> bool {
        (self.first..=self.last).contains(&tag)
    }

    fn after(&self, tag: ActionTag) -> ActionTag {
        if tag >= self.last {
            self.first
        } else {
            tag + 1
        }
    }
}

impl Default for TagRange {
    fn default() -> Self {
        Self::sdk()
    }
}

struct ActiveAction {
    tag: ActionTag,
    cancel: watch::Sender<bool>,
    settled: watch::Receiver<bool>,
}

struct TagBook {
    next: ActionTag,
    active: Option<ActiveAction>,
}

/// Issues actions over an [`ActionChannel`], one at a time.
pub struct ActionTagAllocator<P> {
    channel: Arc<dyn ActionChannel<P>>,
    range: TagRange,
    book: Mutex<TagBook>,
    /// Serializes the cancel-then-allocate phase of `run_action`.
    start_gate: tokio::sync::Mutex<()>,
    bus: EventBus,
}

impl<P: Send + 'static> ActionTagAllocator<P> {
    pub fn new(channel: Arc<dyn ActionChannel<P>>, range: TagRange, bus: EventBus) -> Self {
        Self {
            channel,
            range,
            book: Mutex::new(TagBook {
                next: range.first,
                active: None,
            }),
            start_gate: tokio::sync::Mutex::new(()),
            bus,
        }
    }

    /// Run one action and return its final status.
    ///
    /// Any active action is cancelled first, and its result settles before
    /// this one is sent.  A local [`cancel`][Self::cancel] resolves the call
    /// with [`ActionStatus::Cancelled`].  The active tag is cleared on every
    /// outcome.
    ///
    /// # Errors
    ///
    /// The channel's error when the previous action could not be cancelled
    /// or this one could not be run.
    pub async fn run_action(&self, params: P) -> Result<ActionStatus, LinkError> {
        let (tag, mut cancelled, settled) = {
            let _gate = self.start_gate.lock().await;
            self.cancel_active().await?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (settled_tx, settled_rx) = watch::channel(false);
            let mut book = self.book.lock();
            let tag = book.next;
            book.next = self.range.after(tag);
            book.active = Some(ActiveAction {
                tag,
                cancel: cancel_tx,
                settled: settled_rx,
            });
            (tag, cancel_rx, settled_tx)
        };

        debug!(tag, "action started");
        self.publish(LinkEventPayload::ActionStarted { tag });

        let request = ActionRequest { tag, params };
        let outcome = tokio::select! {
            biased;
            _ = cancelled.wait_for(|c| *c) => Ok(ActionStatus::Cancelled),
            result = self.channel.run(request) => result.map(|completion| {
                if completion.tag != tag {
                    warn!(tag, completed = completion.tag, "completion carries a foreign tag");
                }
                completion.status
            }),
        };

        {
            let mut book = self.book.lock();
            if book.active.as_ref().is_some_and(|a| a.tag == tag) {
                book.active = None;
            }
        }
        settled.send_replace(true);

        match &outcome {
            Ok(status) => {
                debug!(tag, status = ?status, "action finished");
                self.publish(LinkEventPayload::ActionFinished { tag, status: *status });
            }
            Err(err) => warn!(tag, error = %err, "action failed"),
        }
        outcome
    }

    /// Cancel the active action, if any, and wait until its result settles.
    ///
    /// # Errors
    ///
    /// The channel's error when the cancel-by-tag message could not be sent.
    /// Local state is cleared either way.
    pub async fn cancel(&self) -> Result<(), LinkError> {
        self.cancel_active().await
    }

    /// Teardown variant of [`cancel`][Self::cancel]: channel failures are
    /// logged and dropped, since a closing connection makes every action moot.
    pub async fn shutdown(&self) {
        if let Err(err) = self.cancel_active().await {
            debug!(error = %err, "action cancel dropped during shutdown");
        }
    }

    /// Tag of the action in flight, if any.
    pub fn active_tag(&self) -> Option<ActionTag> {
        self.book.lock().active.as_ref().map(|a| a.tag)
    }

    /// Tag the next action will carry.
    pub fn peek_next_tag(&self) -> ActionTag {
        self.book.lock().next
    }

    pub fn range(&self) -> TagRange {
        self.range
    }

    async fn cancel_active(&self) -> Result<(), LinkError> {
        let Some(active) = self.book.lock().active.take() else {
            return Ok(());
        };
        active.cancel.send_replace(true);
        debug!(tag = active.tag, "cancelling action");

        let sent = self.channel.cancel(active.tag).await;
        let mut settled = active.settled;
        // A dropped sender means the owning call was abandoned.
        let _ = settled.wait_for(|done| *done).await;
        sent
    }

    fn publish(&self, payload: LinkEventPayload) {
        self.bus
            .publish(Topic::Actions, LinkEvent::new(SOURCE, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_middleware::{ActionCall, LoopbackActions};
    use std::time::Duration;

    fn allocator(
        actions: &Arc<LoopbackActions<&'static str>>,
        range: TagRange,
    ) -> Arc<ActionTagAllocator<&'static str>> {
        let channel: Arc<dyn ActionChannel<&'static str>> = actions.clone();
        Arc::new(ActionTagAllocator::new(channel, range, EventBus::default()))
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(matches!(TagRange::new(5, 4), Err(LinkError::Config(_))));
        assert_eq!(TagRange::new(4, 4).unwrap().size(), 1);
        assert_eq!(TagRange::sdk().size(), 1_000_000);
        assert!(TagRange::default().contains(FIRST_SDK_TAG));
    }

    #[tokio::test]
    async fn tags_wrap_to_range_start() {
        let actions = Arc::new(LoopbackActions::new().auto_complete(ActionStatus::Completed));
        let alloc = allocator(&actions, TagRange::new(10, 12).unwrap());

        for _ in 0..4 {
            assert_eq!(alloc.run_action("wave").await.unwrap(), ActionStatus::Completed);
        }
        let tags: Vec<_> = actions.requests().iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![10, 11, 12, 10]);
        assert_eq!(alloc.peek_next_tag(), 11);
        assert!(alloc.active_tag().is_none());
    }

    #[tokio::test]
    async fn sdk_range_starts_at_first_sdk_tag() {
        let actions = Arc::new(LoopbackActions::new().auto_complete(ActionStatus::Completed));
        let alloc = allocator(&actions, TagRange::default());
        assert_eq!(alloc.peek_next_tag(), FIRST_SDK_TAG);
        alloc.run_action("dock").await.unwrap();
        assert_eq!(actions.requests()[0].tag, FIRST_SDK_TAG);
    }

    #[tokio::test]
    async fn new_action_cancels_the_previous_one_first() {
        let actions = Arc::new(LoopbackActions::new());
        let alloc = allocator(&actions, TagRange::new(1, 100).unwrap());

        let first = {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move { alloc.run_action("drive").await })
        };
        actions.wait_for_calls(1).await;
        assert_eq!(alloc.active_tag(), Some(1));

        let second = {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move { alloc.run_action("turn").await })
        };
        actions.wait_for_calls(3).await;
        assert_eq!(
            actions.calls(),
            vec![ActionCall::Run(1), ActionCall::Cancel(1), ActionCall::Run(2)]
        );
        assert_eq!(first.await.unwrap(), Ok(ActionStatus::Cancelled));
        assert_eq!(alloc.active_tag(), Some(2));

        assert!(actions.complete(2, ActionStatus::Completed));
        assert_eq!(second.await.unwrap(), Ok(ActionStatus::Completed));
        assert!(alloc.active_tag().is_none());
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let actions = Arc::new(LoopbackActions::new());
        let alloc = allocator(&actions, TagRange::default());
        alloc.cancel().await.unwrap();
        assert!(actions.calls().is_empty());
    }

    #[tokio::test]
    async fn interactive_cancel_surfaces_channel_failure() {
        let actions = Arc::new(LoopbackActions::new());
        actions.fail_cancels(true);
        let alloc = allocator(&actions, TagRange::default());

        let running = {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move { alloc.run_action("sing").await })
        };
        actions.wait_for_calls(1).await;

        let err = alloc.cancel().await.unwrap_err();
        assert!(matches!(err, LinkError::Transport { .. }));
        assert!(alloc.active_tag().is_none());
        assert_eq!(running.await.unwrap(), Ok(ActionStatus::Cancelled));
    }

    #[tokio::test]
    async fn shutdown_swallows_channel_failure() {
        let actions = Arc::new(LoopbackActions::new());
        actions.fail_cancels(true);
        let alloc = allocator(&actions, TagRange::default());

        let running = {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move { alloc.run_action("sing").await })
        };
        actions.wait_for_calls(1).await;

        tokio::time::timeout(Duration::from_secs(1), alloc.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(alloc.active_tag().is_none());
        assert_eq!(running.await.unwrap(), Ok(ActionStatus::Cancelled));
    }

    #[tokio::test]
    async fn device_failure_is_a_status_not_an_error() {
        let actions = Arc::new(LoopbackActions::new().auto_complete(ActionStatus::Failed { code: 4 }));
        let alloc = allocator(&actions, TagRange::default());
        let status = alloc.run_action("lift").await.unwrap();
        assert_eq!(status, ActionStatus::Failed { code: 4 });
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn lifecycle_events_reach_the_bus() {
        let actions = Arc::new(LoopbackActions::new().auto_complete(ActionStatus::Completed));
        let bus = EventBus::default();
        let mut events = bus.subscribe(Topic::Actions);
        let channel: Arc<dyn ActionChannel<&'static str>> = actions.clone();
        let alloc = ActionTagAllocator::new(channel, TagRange::new(1, 9).unwrap(), bus.clone());

        alloc.run_action("nod").await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap().payload,
            LinkEventPayload::ActionStarted { tag: 1 }
        ));
        assert!(matches!(
            events.recv().await.unwrap().payload,
            LinkEventPayload::ActionFinished { tag: 1, status: ActionStatus::Completed }
        ));
    }
}
