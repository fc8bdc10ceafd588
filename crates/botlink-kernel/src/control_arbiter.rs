//! [`ControlArbiter`] – client side of the behavior-control protocol.
//!
//! The device is the arbiter.  It may revoke control at any moment, so every
//! inbound message is authoritative and ownership is never assumed before a
//! grant arrives.  Whenever the control stream goes away the arbiter drops
//! back to [`ControlState::Unowned`].
//!
//! ```text
//! Unowned ──request──> Requesting ──Granted──> Owned ──release──> Releasing ──> Unowned
//!    ▲                     │                     │
//!    └──── Lost / timeout ─┘<──── Lost / stream ended ───────────────────────────┘
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use botlink_middleware::{
    DuplexCall, DuplexStreamLoop, EventBus, LoopExit, LoopOptions, PendingResult, Settlement,
    Topic, Waiter,
};
use botlink_types::{
    ControlRequest, ControlResponse, ControlState, LinkError, LinkEvent, LinkEventPayload,
    LossReason, Priority, StreamState,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

/// Name of the duplex stream backing the arbiter.
pub const CONTROL_STREAM: &str = "behavior_control";

const SOURCE: &str = "botlink-kernel::control";

/// Tunables for one arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Timeout used by [`ControlArbiter::request_control_default`] and by
    /// automatic re-acquisition.
    pub request_timeout: Duration,
    /// Ask for control again after the device revokes it.
    pub auto_reacquire: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            auto_reacquire: false,
        }
    }
}

struct ControlBook {
    state: ControlState,
    /// Last state the device confirmed.
    observed: ControlState,
    requested: Option<Priority>,
    granted: Option<Priority>,
    pending: Option<PendingResult<bool>>,
    request_id: u64,
    /// Releases written but not yet confirmed by the device.  The device
    /// answers a release with at most one loss, and answers in order, so
    /// that many losses are confirmations rather than revocations.
    unconfirmed_releases: u32,
}

impl ControlBook {
    fn new() -> Self {
        Self {
            state: ControlState::Unowned,
            observed: ControlState::Unowned,
            requested: None,
            granted: None,
            pending: None,
            request_id: 0,
            unconfirmed_releases: 0,
        }
    }

    fn settle_pending(&mut self, value: bool) {
        if let Some(pending) = self.pending.take() {
            pending.settle(value);
        }
    }

    fn drop_to_unowned(&mut self) {
        self.state = ControlState::Unowned;
        self.observed = ControlState::Unowned;
        self.granted = None;
    }
}

struct ArbiterInner {
    stream: DuplexStreamLoop<ControlRequest, ControlResponse>,
    book: Mutex<ControlBook>,
    bus: EventBus,
    config: ArbiterConfig,
}

/// Behavior-control state machine over one duplex stream.
///
/// Cheap to clone; clones share the stream and the state.  Exactly one
/// arbiter should exist per device connection.
#[derive(Clone)]
pub struct ControlArbiter {
    inner: Arc<ArbiterInner>,
}

impl std::fmt::Debug for ControlArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlArbiter")
            .field("state", &self.state())
            .field("stream", &self.inner.stream.state())
            .finish()
    }
}

impl ControlArbiter {
    pub fn new(
        call: Arc<dyn DuplexCall<ControlRequest, ControlResponse>>,
        config: ArbiterConfig,
        bus: EventBus,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ArbiterInner>| {
            let on_message = weak.clone();
            let stream = DuplexStreamLoop::with_options(
                CONTROL_STREAM,
                call,
                move |message| {
                    if let Some(inner) = on_message.upgrade() {
                        inner.on_message(message);
                    }
                },
                LoopOptions::default().with_bus(bus.clone()),
            );

            let on_ended = weak.clone();
            stream.on_ended(move |exit| {
                if let Some(inner) = on_ended.upgrade() {
                    inner.on_stream_ended(exit);
                }
            });

            ArbiterInner {
                stream,
                book: Mutex::new(ControlBook::new()),
                bus,
                config,
            }
        });
        Self { inner }
    }

    /// Ask the device for control at `priority` and wait up to `timeout` for
    /// its answer.
    ///
    /// Returns `Ok(true)` on a grant and `Ok(false)` when the device denies
    /// or revokes control, or the stream ends, before the answer.  Returns
    /// immediately with `Ok(true)` when control is already held at
    /// `priority`.
    ///
    /// # Errors
    ///
    /// - [`LinkError::ControlTimeout`] when no answer arrived in time.  The
    ///   stream keeps running and the state reverts to the last one the
    ///   device confirmed.
    /// - [`LinkError::ControlSuperseded`] when a newer request replaced this
    ///   one while it was waiting.
    /// - The stream's fault when the request could not be written.
    pub async fn request_control(
        &self,
        priority: Priority,
        timeout: Duration,
    ) -> Result<bool, LinkError> {
        let (request_id, waiter) = {
            let mut book = self.inner.book.lock();
            if book.state == ControlState::Owned
                && book.granted == Some(priority)
                && self.inner.stream.is_active()
            {
                return Ok(true);
            }
            if let Some(previous) = book.pending.take() {
                previous.cancel();
            }
            let pending = PendingResult::new();
            let waiter = pending.waiter();
            book.pending = Some(pending);
            book.state = ControlState::Requesting;
            book.requested = Some(priority);
            book.request_id += 1;
            (book.request_id, waiter)
        };

        debug!(priority = %priority, "requesting behavior control");
        if let Err(err) = self
            .inner
            .stream
            .send(ControlRequest::Request { priority })
            .await
        {
            self.inner.abandon_request(request_id, false);
            return Err(err);
        }

        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Settlement::Value(granted)) => Ok(granted),
            Ok(Settlement::Cancelled) => Err(LinkError::ControlSuperseded),
            Err(_) => {
                self.inner.abandon_request(request_id, true);
                warn!(
                    priority = %priority,
                    timeout_ms = timeout.as_millis() as u64,
                    "behavior control request timed out"
                );
                Err(LinkError::ControlTimeout {
                    priority,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// [`request_control`][Self::request_control] with the configured timeout.
    pub async fn request_control_default(&self, priority: Priority) -> Result<bool, LinkError> {
        self.request_control(priority, self.inner.config.request_timeout)
            .await
    }

    /// Hand control back to the device.
    ///
    /// A no-op unless the stream is active and control is held.  The device
    /// stops arbitrating as soon as it reads the message, so no
    /// acknowledgement is awaited.
    pub async fn release_control(&self) {
        {
            let mut book = self.inner.book.lock();
            if !self.inner.stream.is_active() || book.state != ControlState::Owned {
                return;
            }
            book.state = ControlState::Releasing;
            book.unconfirmed_releases += 1;
        }

        let sent = self.inner.stream.send(ControlRequest::Release).await;

        let released = {
            let mut book = self.inner.book.lock();
            if book.state == ControlState::Releasing {
                book.drop_to_unowned();
                book.settle_pending(false);
                true
            } else {
                false
            }
        };

        match sent {
            Ok(()) if released => {
                info!("behavior control released");
                self.inner.publish(LinkEventPayload::ControlReleased);
            }
            Ok(()) => {}
            // The stream ended underneath us, which already forced Unowned.
            Err(err) => debug!(error = %err, "release not written"),
        }
    }

    /// Waiter for the next grant or loss.  Shares the outstanding request's
    /// result when there is one.
    pub fn wait_for_control_change(&self) -> Waiter<bool> {
        self.inner
            .book
            .lock()
            .pending
            .get_or_insert_with(PendingResult::new)
            .waiter()
    }

    /// Current ownership.  Never `Owned` unless the stream is active.
    pub fn state(&self) -> ControlState {
        let state = self.inner.book.lock().state;
        if state == ControlState::Owned && !self.inner.stream.is_active() {
            ControlState::Unowned
        } else {
            state
        }
    }

    pub fn is_owned(&self) -> bool {
        self.state() == ControlState::Owned
    }

    /// Priority of the current grant, if control is held.
    pub fn granted_priority(&self) -> Option<Priority> {
        if self.is_owned() {
            self.inner.book.lock().granted
        } else {
            None
        }
    }

    /// `Err(LinkError::ControlNotOwned)` unless control is held.
    pub fn ensure_owned(&self) -> Result<(), LinkError> {
        if self.is_owned() {
            Ok(())
        } else {
            Err(LinkError::ControlNotOwned)
        }
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.stream.state()
    }

    pub fn config(&self) -> ArbiterConfig {
        self.inner.config
    }

    /// Release control if held, then close the control stream.
    pub async fn disconnect(&self) {
        self.release_control().await;
        self.inner.stream.end().await;
    }
}

impl ArbiterInner {
    fn on_message(self: &Arc<Self>, message: ControlResponse) {
        match message {
            ControlResponse::Granted => self.on_granted(),
            ControlResponse::Lost => self.on_lost(LossReason::Revoked),
            ControlResponse::ReservedControlLost => self.on_lost(LossReason::ReservedControlLost),
            other => trace!(message = ?other, "ignoring control message"),
        }
    }

    fn on_granted(&self) {
        let priority = {
            let mut book = self.book.lock();
            let priority = book.requested.or(book.granted).unwrap_or_default();
            book.state = ControlState::Owned;
            book.observed = ControlState::Owned;
            book.granted = Some(priority);
            // Any confirmation of an earlier release was read before this.
            book.unconfirmed_releases = 0;
            book.settle_pending(true);
            priority
        };
        info!(priority = %priority, "behavior control granted");
        self.publish(LinkEventPayload::ControlGranted { priority });
    }

    fn on_lost(self: &Arc<Self>, reason: LossReason) {
        let reacquire = {
            let mut book = self.book.lock();
            if book.unconfirmed_releases > 0 {
                // The device confirming our own release.
                book.unconfirmed_releases -= 1;
                // A request written after the release waits for its own answer.
                if book.state != ControlState::Requesting {
                    book.settle_pending(false);
                }
                trace!(reason = ?reason, "control loss after local release");
                return;
            }
            let was_owned = book.state == ControlState::Owned;
            let priority = book.granted;
            book.drop_to_unowned();
            book.settle_pending(false);
            if self.config.auto_reacquire && was_owned {
                priority
            } else {
                None
            }
        };

        warn!(reason = ?reason, "behavior control lost");
        self.publish(LinkEventPayload::ControlLost { reason });

        if let Some(priority) = reacquire {
            let arbiter = ControlArbiter {
                inner: Arc::clone(self),
            };
            tokio::spawn(async move {
                match arbiter.request_control_default(priority).await {
                    Ok(true) => info!(priority = %priority, "behavior control re-acquired"),
                    Ok(false) => warn!(priority = %priority, "behavior control re-acquisition denied"),
                    Err(err) => warn!(priority = %priority, error = %err, "behavior control re-acquisition failed"),
                }
            });
        }
    }

    fn on_stream_ended(&self, exit: &LoopExit) {
        let was_engaged = {
            let mut book = self.book.lock();
            let engaged = matches!(
                book.state,
                ControlState::Owned | ControlState::Requesting | ControlState::Releasing
            );
            book.drop_to_unowned();
            book.unconfirmed_releases = 0;
            book.settle_pending(false);
            engaged
        };
        if was_engaged {
            warn!(fault = ?exit.fault, "control stream ended while engaged");
            self.publish(LinkEventPayload::ControlLost {
                reason: LossReason::Disconnected,
            });
        }
    }

    /// Give up on request `request_id` if it is still the latest one.
    fn abandon_request(&self, request_id: u64, keep_waiting: bool) {
        let mut book = self.book.lock();
        if book.request_id != request_id || book.state != ControlState::Requesting {
            return;
        }
        book.state = book.observed;
        // Observers may still see a late answer to a timed-out request.
        if !keep_waiting {
            book.settle_pending(false);
        }
    }

    fn publish(&self, payload: LinkEventPayload) {
        self.bus
            .publish(Topic::Control, LinkEvent::new(SOURCE, payload));
    }
}
