//! [`StreamLoop`] – lifecycle manager for one server-streaming call.
//!
//! Each run owns a dedicated tokio task that opens the call, delivers every
//! inbound message to the handler in arrival order, and on termination runs
//! the ended hooks exactly once before resetting so the loop can be started
//! again.
//!
//! ```text
//! Idle/Faulted ──start()──> Starting ──opened──> Active
//!      ▲                        │                  │
//!      │                  open failed        end() / closed / fault
//!      │                        ▼                  ▼
//!      └──────── hooks ran ── Ending <─────────────┘
//! ```
//!
//! The lifecycle bookkeeping lives in [`LoopCore`] so that
//! [`DuplexStreamLoop`][crate::duplex_loop::DuplexStreamLoop] shares it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use botlink_types::{LinkError, LinkEvent, LinkEventPayload, StreamState};
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error};

use crate::bus::{EventBus, Topic};
use crate::transport::{InboundStream, ServerStreamCall};

/// Callback invoked once per inbound message on the loop's task.
pub type MessageHandler<M> = Arc<dyn Fn(M) + Send + Sync>;

/// Receives every captured fault, tagged with the stream name.
pub type FaultHandler = Arc<dyn Fn(&str, &LinkError) + Send + Sync>;

/// Runs once per terminated run, before [`StreamLoop::end`] resolves.
pub type EndedHook = Arc<dyn Fn(&LoopExit) + Send + Sync>;

/// How one run of a loop terminated.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopExit {
    pub stream: String,
    /// `None` for a normal close or a cancellation.
    pub fault: Option<LinkError>,
}

/// Optional wiring for a loop.
#[derive(Clone)]
pub struct LoopOptions {
    bus: Option<EventBus>,
    fault_handler: FaultHandler,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            bus: None,
            fault_handler: Arc::new(|stream, err| {
                error!(stream = %stream, error = %err, "stream faulted");
            }),
        }
    }
}

impl LoopOptions {
    /// Publish started/ended events on `bus` ([`Topic::Lifecycle`]).
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the default logging fault handler.
    pub fn with_fault_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &LinkError) + Send + Sync + 'static,
    {
        self.fault_handler = Arc::new(handler);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared lifecycle core
// ─────────────────────────────────────────────────────────────────────────────

struct RunControl {
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

struct StreamHandle {
    run: Option<RunControl>,
    last_fault: Option<LinkError>,
    generation: u64,
}

/// Per-run capability handed to the background task.
pub(crate) struct RunTicket {
    generation: u64,
    cancel: watch::Receiver<bool>,
    finished: watch::Sender<bool>,
}

impl RunTicket {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender also means the run is over.
    let _ = cancel.wait_for(|c| *c).await;
}

pub(crate) struct LoopCore {
    name: String,
    state: watch::Sender<StreamState>,
    handle: Mutex<StreamHandle>,
    ended_hooks: Mutex<Vec<EndedHook>>,
    options: LoopOptions,
}

impl LoopCore {
    pub(crate) fn new(name: String, options: LoopOptions) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            name,
            state,
            handle: Mutex::new(StreamHandle {
                run: None,
                last_fault: None,
                generation: 0,
            }),
            ended_hooks: Mutex::new(Vec::new()),
            options,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub(crate) fn last_fault(&self) -> Option<LinkError> {
        self.handle.lock().last_fault.clone()
    }

    pub(crate) fn on_ended(&self, hook: EndedHook) {
        self.ended_hooks.lock().push(hook);
    }

    /// Error to hand a writer when the loop cannot take its message.
    pub(crate) fn closed_error(&self) -> LinkError {
        self.last_fault()
            .unwrap_or_else(|| LinkError::StreamClosed(self.name.clone()))
    }

    /// Claim a new run.  Fails fast without touching state when one exists.
    pub(crate) fn begin_run(&self) -> Result<RunTicket, LinkError> {
        let mut handle = self.handle.lock();
        if !self.state().can_start() {
            return Err(LinkError::AlreadyActive(self.name.clone()));
        }
        handle.generation += 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        handle.run = Some(RunControl {
            cancel: cancel_tx,
            finished: finished_rx,
        });
        handle.last_fault = None;
        self.state.send_replace(StreamState::Starting);
        Ok(RunTicket {
            generation: handle.generation,
            cancel: cancel_rx,
            finished: finished_tx,
        })
    }

    /// Run `f` under the lifecycle lock, only while run `generation` is
    /// Active.  Writers use this so nothing is written once `end` begins.
    pub(crate) fn with_active<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let handle = self.handle.lock();
        if handle.generation == generation && self.state().is_active() {
            Some(f())
        } else {
            None
        }
    }

    pub(crate) async fn wait_while_starting(&self) {
        let mut state = self.state_watch();
        let _ = state.wait_for(|s| *s != StreamState::Starting).await;
    }

    pub(crate) async fn end(&self) {
        let finished = {
            let handle = self.handle.lock();
            let Some(run) = handle.run.as_ref() else {
                return;
            };
            if matches!(self.state(), StreamState::Starting | StreamState::Active) {
                self.state.send_replace(StreamState::Ending);
            }
            run.cancel.send_replace(true);
            run.finished.clone()
        };
        debug!(stream = %self.name, "end requested");
        let mut finished = finished;
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Body of the background task for one run.
    pub(crate) async fn drive<M, F>(
        self: Arc<Self>,
        ticket: RunTicket,
        started: oneshot::Sender<()>,
        open: F,
        handler: MessageHandler<M>,
    ) where
        M: Send + 'static,
        F: Future<Output = Result<InboundStream<M>, LinkError>> + Send,
    {
        let mut cancel = ticket.cancel.clone();
        let mut started = Some(started);

        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(LinkError::Cancelled),
            result = AssertUnwindSafe(open).catch_unwind() => result.unwrap_or_else(|_| {
                Err(LinkError::transport(self.name.as_str(), "transport panicked while opening"))
            }),
        };

        let fault = match opened {
            Ok(inbound) => {
                self.mark_active(ticket.generation);
                if let Some(tx) = started.take() {
                    let _ = tx.send(());
                }
                self.pump(&ticket, &mut cancel, inbound, &handler).await
            }
            Err(err) if err.is_cancellation() || ticket.is_cancelled() => None,
            Err(err) => Some(err),
        };

        self.finish(ticket, fault);
        // An open failure is only reported to `start` once state has settled.
        if let Some(tx) = started.take() {
            let _ = tx.send(());
        }
    }

    async fn pump<M>(
        &self,
        ticket: &RunTicket,
        cancel: &mut watch::Receiver<bool>,
        mut inbound: InboundStream<M>,
        handler: &MessageHandler<M>,
    ) -> Option<LinkError> {
        loop {
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return None,
                next = AssertUnwindSafe(inbound.next()).catch_unwind() => match next {
                    Err(_) => {
                        return Some(LinkError::transport(
                            self.name.as_str(),
                            "transport panicked while reading",
                        ));
                    }
                    Ok(Some(Ok(message))) => {
                        if ticket.is_cancelled() {
                            return None;
                        }
                        let delivered =
                            std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
                        if delivered.is_err() {
                            return Some(LinkError::HandlerPanicked(self.name.clone()));
                        }
                    }
                    Ok(Some(Err(err))) if err.is_cancellation() || ticket.is_cancelled() => {
                        return None;
                    }
                    Ok(Some(Err(err))) => return Some(err),
                    Ok(None) => return None,
                },
            }
        }
    }

    fn mark_active(&self, generation: u64) {
        {
            let handle = self.handle.lock();
            if handle.generation != generation || self.state() != StreamState::Starting {
                return;
            }
            self.state.send_replace(StreamState::Active);
        }
        debug!(stream = %self.name, "stream opened");
        self.publish(LinkEventPayload::StreamStarted {
            stream: self.name.clone(),
        });
    }

    fn finish(&self, ticket: RunTicket, fault: Option<LinkError>) {
        {
            let _handle = self.handle.lock();
            self.state.send_replace(StreamState::Ending);
        }

        if let Some(err) = &fault {
            (self.options.fault_handler)(&self.name, err);
        }
        let exit = LoopExit {
            stream: self.name.clone(),
            fault: fault.clone(),
        };
        let hooks: Vec<EndedHook> = self.ended_hooks.lock().clone();
        for hook in &hooks {
            hook(&exit);
        }
        self.publish(LinkEventPayload::StreamEnded {
            stream: self.name.clone(),
            fault: fault.clone(),
        });

        {
            let mut handle = self.handle.lock();
            handle.run = None;
            let next = if fault.is_some() {
                StreamState::Faulted
            } else {
                StreamState::Idle
            };
            handle.last_fault = fault;
            self.state.send_replace(next);
        }
        debug!(stream = %self.name, "stream ended");
        ticket.finished.send_replace(true);
    }

    fn publish(&self, payload: LinkEventPayload) {
        if let Some(bus) = &self.options.bus {
            let source = format!("botlink-middleware::stream/{}", self.name);
            bus.publish(Topic::Lifecycle, LinkEvent::new(source, payload));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type-erased lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle surface shared by both loop flavours, so owners can track
/// heterogeneous feeds together.
#[async_trait]
pub trait StreamLifecycle: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> StreamState;

    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    async fn end(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// StreamLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Receive loop over one server-streaming call.
///
/// Cheap to clone; clones drive the same call.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use botlink_middleware::{LoopbackFeed, ServerStreamCall, StreamLoop};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), botlink_types::LinkError> {
/// let feed = Arc::new(LoopbackFeed::<u32>::new());
/// let call: Arc<dyn ServerStreamCall<u32>> = feed.clone();
/// let telemetry = StreamLoop::new("telemetry", call, |sample: u32| {
///     println!("battery {sample}%");
/// });
///
/// telemetry.start().await?;
/// feed.push(87);
/// telemetry.end().await;
/// assert!(!telemetry.is_active());
/// # Ok(())
/// # }
/// ```
pub struct StreamLoop<M> {
    core: Arc<LoopCore>,
    call: Arc<dyn ServerStreamCall<M>>,
    handler: MessageHandler<M>,
}

impl<M> Clone for StreamLoop<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            call: Arc::clone(&self.call),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<M: Send + 'static> StreamLoop<M> {
    pub fn new<F>(name: impl Into<String>, call: Arc<dyn ServerStreamCall<M>>, handler: F) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self::with_options(name, call, handler, LoopOptions::default())
    }

    pub fn with_options<F>(
        name: impl Into<String>,
        call: Arc<dyn ServerStreamCall<M>>,
        handler: F,
        options: LoopOptions,
    ) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self {
            core: Arc::new(LoopCore::new(name.into(), options)),
            call,
            handler: Arc::new(handler),
        }
    }

    /// Open the call on a fresh background task.
    ///
    /// Resolves once the call is open, or once a failed open has been
    /// captured (see [`last_fault`][Self::last_fault]).
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadyActive`] if a run is already in progress.  Open
    /// and read faults are never returned here.
    pub async fn start(&self) -> Result<(), LinkError> {
        let ticket = self.core.begin_run()?;
        let (started_tx, started_rx) = oneshot::channel();
        let core = Arc::clone(&self.core);
        let call = Arc::clone(&self.call);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let open = async move { call.open().await };
            core.drive(ticket, started_tx, open, handler).await;
        });
        let _ = started_rx.await;
        Ok(())
    }

    /// Cancel the current run and wait until it has fully unwound.
    /// Resolves immediately when nothing is running.
    pub async fn end(&self) {
        self.core.end().await;
    }

    pub fn is_active(&self) -> bool {
        self.core.state().is_active()
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    pub fn last_fault(&self) -> Option<LinkError> {
        self.core.last_fault()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Register a hook that runs once after every run terminates.
    pub fn on_ended<F>(&self, hook: F)
    where
        F: Fn(&LoopExit) + Send + Sync + 'static,
    {
        self.core.on_ended(Arc::new(hook));
    }

    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.core.state_watch()
    }
}

#[async_trait]
impl<M: Send + 'static> StreamLifecycle for StreamLoop<M> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    async fn end(&self) {
        self.core.end().await;
    }
}
