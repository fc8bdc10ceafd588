//! In-memory transports with scripted replies and fault injection.
//!
//! | Type | Implements | Scripted by |
//! |---|---|---|
//! | [`LoopbackFeed`] | [`ServerStreamCall`] | `push`, `fail`, `close` |
//! | [`LoopbackDuplex`] | [`DuplexCall`] | a responder closure plus `push` |
//! | [`LoopbackActions`] | [`ActionChannel`] | `complete`, or auto-complete |
//!
//! Each open of a loopback call is a fresh call.  Scripting targets the
//! call that is currently open.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use botlink_types::{ActionCompletion, ActionRequest, ActionStatus, ActionTag, LinkError};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::transport::{ActionChannel, DuplexCall, InboundStream, OutboundStream, ServerStreamCall};

type InboundTx<M> = mpsc::UnboundedSender<Result<M, LinkError>>;

fn inbound_stream<M: Send + 'static>(
    rx: mpsc::UnboundedReceiver<Result<M, LinkError>>,
) -> InboundStream<M> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

// ─────────────────────────────────────────────────────────────────────────────
// Server streaming
// ─────────────────────────────────────────────────────────────────────────────

struct FeedInner<M> {
    current: Option<InboundTx<M>>,
    backlog: Vec<M>,
    fail_next_open: Option<LinkError>,
    open_count: usize,
}

/// Scripted server-streaming endpoint.
///
/// Messages pushed while no call is open are held and delivered first on
/// the next open.
pub struct LoopbackFeed<M> {
    inner: Mutex<FeedInner<M>>,
}

impl<M> LoopbackFeed<M> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                current: None,
                backlog: Vec::new(),
                fail_next_open: None,
                open_count: 0,
            }),
        }
    }

    /// Deliver `message` on the open call.
    pub fn push(&self, message: M) {
        let mut inner = self.inner.lock();
        let rejected = match inner.current.as_ref() {
            Some(tx) => match tx.send(Ok(message)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(rejected)) => rejected,
            },
            None => Ok(message),
        };
        // The reader went away; hold the message for the next call.
        inner.current = None;
        if let Ok(message) = rejected {
            inner.backlog.push(message);
        }
    }

    /// Terminate the open call with `err`.
    pub fn fail(&self, err: LinkError) {
        if let Some(tx) = self.inner.lock().current.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Close the open call normally.
    pub fn close(&self) {
        self.inner.lock().current.take();
    }

    /// Make the next `open` fail with `err`.
    pub fn fail_next_open(&self, err: LinkError) {
        self.inner.lock().fail_next_open = Some(err);
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }
}

impl<M> Default for LoopbackFeed<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: Send + 'static> ServerStreamCall<M> for LoopbackFeed<M> {
    async fn open(&self) -> Result<InboundStream<M>, LinkError> {
        let mut inner = self.inner.lock();
        inner.open_count += 1;
        if let Some(err) = inner.fail_next_open.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for message in inner.backlog.drain(..) {
            let _ = tx.send(Ok(message));
        }
        inner.current = Some(tx);
        Ok(inbound_stream(rx))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Duplex
// ─────────────────────────────────────────────────────────────────────────────

type Responder<O, I> = Arc<dyn Fn(&O) -> Vec<I> + Send + Sync>;

struct DuplexInner<O, I> {
    current: Option<InboundTx<I>>,
    call_id: u64,
    responder: Option<Responder<O, I>>,
    sent: Vec<O>,
    fail_next_open: Option<LinkError>,
    open_count: usize,
}

/// Scripted bidirectional endpoint.
///
/// Every outbound message is recorded and handed to the responder; whatever
/// the responder returns is delivered inbound on the same call.
pub struct LoopbackDuplex<O, I> {
    inner: Arc<Mutex<DuplexInner<O, I>>>,
    sent_count: watch::Sender<usize>,
}

impl<O, I> LoopbackDuplex<O, I> {
    /// An endpoint that records outbound messages and never replies.
    pub fn new() -> Self {
        let (sent_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(DuplexInner {
                current: None,
                call_id: 0,
                responder: None,
                sent: Vec::new(),
                fail_next_open: None,
                open_count: 0,
            })),
            sent_count,
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&O) -> Vec<I> + Send + Sync + 'static,
    {
        let duplex = Self::new();
        duplex.set_responder(responder);
        duplex
    }

    /// Replace the responder for every later outbound message.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&O) -> Vec<I> + Send + Sync + 'static,
    {
        self.inner.lock().responder = Some(Arc::new(responder));
    }

    /// Deliver `message` inbound on the open call.  Returns `false` when no
    /// call is open.
    pub fn push(&self, message: I) -> bool {
        match self.inner.lock().current.as_ref() {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    pub fn fail(&self, err: LinkError) {
        if let Some(tx) = self.inner.lock().current.take() {
            let _ = tx.send(Err(err));
        }
    }

    pub fn close(&self) {
        self.inner.lock().current.take();
    }

    pub fn fail_next_open(&self, err: LinkError) {
        self.inner.lock().fail_next_open = Some(err);
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }

    /// Resolves once at least `count` outbound messages were recorded.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut seen = self.sent_count.subscribe();
        let _ = seen.wait_for(|n| *n >= count).await;
    }
}

impl<O: Clone, I> LoopbackDuplex<O, I> {
    /// Every outbound message recorded so far, across all calls.
    pub fn sent(&self) -> Vec<O> {
        self.inner.lock().sent.clone()
    }
}

impl<O, I> Default for LoopbackDuplex<O, I> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<O, I> DuplexCall<O, I> for LoopbackDuplex<O, I>
where
    O: Send + 'static,
    I: Send + 'static,
{
    async fn open(&self, mut outbound: OutboundStream<O>) -> Result<InboundStream<I>, LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let call_id = {
            let mut inner = self.inner.lock();
            inner.open_count += 1;
            if let Some(err) = inner.fail_next_open.take() {
                return Err(err);
            }
            inner.call_id += 1;
            inner.current = Some(tx);
            inner.call_id
        };

        let inner = Arc::clone(&self.inner);
        let sent_count = self.sent_count.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.next().await {
                let responder = inner.lock().responder.clone();
                let replies = responder
                    .map(|respond| respond(&message))
                    .unwrap_or_default();

                let mut guard = inner.lock();
                guard.sent.push(message);
                let count = guard.sent.len();
                if guard.call_id == call_id
                    && let Some(tx) = guard.current.as_ref()
                {
                    for reply in replies {
                        let _ = tx.send(Ok(reply));
                    }
                }
                drop(guard);
                sent_count.send_replace(count);
            }
            debug!(call_id, "loopback outbound closed");
        });

        Ok(inbound_stream(rx))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// One call observed by [`LoopbackActions`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCall {
    Run(ActionTag),
    Cancel(ActionTag),
}

struct ActionsInner<P> {
    in_flight: HashMap<ActionTag, oneshot::Sender<ActionStatus>>,
    calls: Vec<ActionCall>,
    requests: Vec<ActionRequest<P>>,
    auto_complete: Option<ActionStatus>,
    fail_cancels: bool,
}

/// Scripted action endpoint.
///
/// `run` stays pending until [`complete`][Self::complete] or a `cancel` for
/// the same tag, unless auto-completion is configured.
pub struct LoopbackActions<P> {
    inner: Mutex<ActionsInner<P>>,
    call_count: watch::Sender<usize>,
}

impl<P> LoopbackActions<P> {
    pub fn new() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            inner: Mutex::new(ActionsInner {
                in_flight: HashMap::new(),
                calls: Vec::new(),
                requests: Vec::new(),
                auto_complete: None,
                fail_cancels: false,
            }),
            call_count,
        }
    }

    /// Complete every action immediately with `status`.
    pub fn auto_complete(self, status: ActionStatus) -> Self {
        self.inner.lock().auto_complete = Some(status);
        self
    }

    /// Make every later `cancel` fail with a transport fault.
    pub fn fail_cancels(&self, fail: bool) {
        self.inner.lock().fail_cancels = fail;
    }

    /// Finish the in-flight action carrying `tag`.  Returns `false` if no
    /// such action is waiting.
    pub fn complete(&self, tag: ActionTag, status: ActionStatus) -> bool {
        match self.inner.lock().in_flight.remove(&tag) {
            Some(tx) => tx.send(status).is_ok(),
            None => false,
        }
    }

    /// Every run and cancel observed so far.
    pub fn calls(&self) -> Vec<ActionCall> {
        self.inner.lock().calls.clone()
    }

    /// Resolves once at least `count` runs or cancels were observed.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut seen = self.call_count.subscribe();
        let _ = seen.wait_for(|n| *n >= count).await;
    }

    fn record(&self, inner: &mut ActionsInner<P>, call: ActionCall) {
        inner.calls.push(call);
        let count = inner.calls.len();
        self.call_count.send_replace(count);
    }
}

impl<P: Clone> LoopbackActions<P> {
    pub fn requests(&self) -> Vec<ActionRequest<P>> {
        self.inner.lock().requests.clone()
    }
}

impl<P> Default for LoopbackActions<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: Send + 'static> ActionChannel<P> for LoopbackActions<P> {
    async fn run(&self, request: ActionRequest<P>) -> Result<ActionCompletion, LinkError> {
        let tag = request.tag;
        let waiting = {
            let mut inner = self.inner.lock();
            self.record(&mut inner, ActionCall::Run(tag));
            inner.requests.push(request);
            match inner.auto_complete {
                Some(status) => return Ok(ActionCompletion { tag, status }),
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.in_flight.insert(tag, tx);
                    rx
                }
            }
        };
        match waiting.await {
            Ok(status) => Ok(ActionCompletion { tag, status }),
            Err(_) => Err(LinkError::transport("actions", "action dropped by device")),
        }
    }

    async fn cancel(&self, tag: ActionTag) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        self.record(&mut inner, ActionCall::Cancel(tag));
        if inner.fail_cancels {
            return Err(LinkError::transport("actions", "cancel rejected"));
        }
        if let Some(tx) = inner.in_flight.remove(&tag) {
            let _ = tx.send(ActionStatus::Cancelled);
        }
        Ok(())
    }
}
