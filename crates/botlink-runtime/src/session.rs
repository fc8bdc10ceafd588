//! [`DeviceSession`] – everything owned by one device connection.
//!
//! The session is the single owner of per-connection state:
//!
//! | Field | Purpose |
//! |---|---|
//! | [`DeviceCapabilities`] | Firmware-gated feature flags. |
//! | [`MotionProfile`] | Defaults for motion commands. |
//! | [`EventBus`] | Fan-out for lifecycle, control and action events. |
//! | [`ControlArbiter`] | Behavior-control ownership. |
//! | [`ActionTagAllocator`] | Tagged, single-active actions. |
//! | feeds | Running [`StreamLoop`]s opened through [`DeviceSession::open_feed`]. |
//!
//! Two sessions never share any of it.  [`DeviceSession::disconnect`] tears
//! all of it down in one call.

use std::sync::Arc;

use botlink_kernel::{ActionTagAllocator, ControlArbiter};
use botlink_middleware::{
    EventBus, LoopOptions, ServerStreamCall, StreamLifecycle, StreamLoop,
};
use botlink_types::{ActionStatus, ActionTag, LinkError, Priority};
use parking_lot::Mutex;
use semver::Version;
use tracing::{debug, info};

use crate::capabilities::{DeviceCapabilities, MotionProfile};
use crate::config::SessionConfig;
use crate::link::DeviceLink;

pub struct DeviceSession<P> {
    config: SessionConfig,
    capabilities: DeviceCapabilities,
    motion: Mutex<MotionProfile>,
    bus: EventBus,
    arbiter: ControlArbiter,
    actions: ActionTagAllocator<P>,
    feeds: Mutex<Vec<Arc<dyn StreamLifecycle>>>,
}

impl<P: Send + 'static> DeviceSession<P> {
    /// Build the per-connection state for `link`.
    ///
    /// No stream is opened here; the control stream starts with the first
    /// control request.
    ///
    /// # Errors
    ///
    /// [`LinkError::Config`] when `config` fails validation.
    pub fn connect(
        link: &dyn DeviceLink<P>,
        config: SessionConfig,
        firmware: Version,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let range = config.actions.tag_range()?;
        let bus = EventBus::new(config.streams.event_capacity);
        let arbiter =
            ControlArbiter::new(link.control(), config.control.arbiter_config(), bus.clone());
        let actions = ActionTagAllocator::new(link.actions(), range, bus.clone());

        info!(
            firmware = %firmware,
            first_tag = range.first(),
            last_tag = range.last(),
            "device session connected"
        );

        Ok(Self {
            capabilities: DeviceCapabilities::from_firmware(firmware),
            motion: Mutex::new(config.motion),
            config,
            bus,
            arbiter,
            actions,
            feeds: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn motion_profile(&self) -> MotionProfile {
        *self.motion.lock()
    }

    /// # Errors
    ///
    /// [`LinkError::Config`] when a value is not positive; the previous
    /// profile stays in place.
    pub fn set_motion_profile(&self, profile: MotionProfile) -> Result<(), LinkError> {
        profile.validate()?;
        *self.motion.lock() = profile;
        Ok(())
    }

    /// A clone of the session bus.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn arbiter(&self) -> &ControlArbiter {
        &self.arbiter
    }

    pub fn actions(&self) -> &ActionTagAllocator<P> {
        &self.actions
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Ask for behavior control with the configured timeout.
    ///
    /// # Errors
    ///
    /// [`LinkError::Unsupported`] when the firmware predates `priority`
    /// (nothing is sent), otherwise as
    /// [`ControlArbiter::request_control`].
    pub async fn request_control(&self, priority: Priority) -> Result<bool, LinkError> {
        self.capabilities.check_priority(priority)?;
        self.arbiter
            .request_control(priority, self.config.control.request_timeout())
            .await
    }

    /// [`request_control`][Self::request_control] at the configured default
    /// priority.
    pub async fn request_default_control(&self) -> Result<bool, LinkError> {
        self.request_control(self.config.control.default_priority)
            .await
    }

    pub async fn release_control(&self) {
        self.arbiter.release_control().await;
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    /// Run an action, cancelling whichever one is still in flight.
    ///
    /// # Errors
    ///
    /// [`LinkError::ControlNotOwned`] when control is not held (nothing is
    /// sent), otherwise as [`ActionTagAllocator::run_action`].
    pub async fn run_action(&self, params: P) -> Result<ActionStatus, LinkError> {
        self.arbiter.ensure_owned()?;
        self.actions.run_action(params).await
    }

    pub async fn cancel_action(&self) -> Result<(), LinkError> {
        self.actions.cancel().await
    }

    pub fn active_action(&self) -> Option<ActionTag> {
        self.actions.active_tag()
    }

    // ── Feeds ────────────────────────────────────────────────────────────────

    /// Open a server-streaming feed and track it until
    /// [`disconnect`][Self::disconnect].
    ///
    /// Feeds that have since ended or faulted are dropped from tracking
    /// here, so a feed the caller ends and later restarts is no longer torn
    /// down by `disconnect`.
    ///
    /// # Errors
    ///
    /// As [`StreamLoop::start`].
    pub async fn open_feed<M, F>(
        &self,
        name: impl Into<String>,
        call: Arc<dyn ServerStreamCall<M>>,
        handler: F,
    ) -> Result<StreamLoop<M>, LinkError>
    where
        M: Send + 'static,
        F: Fn(M) + Send + Sync + 'static,
    {
        let feed = StreamLoop::with_options(
            name,
            call,
            handler,
            LoopOptions::default().with_bus(self.bus.clone()),
        );
        feed.start().await?;
        debug!(stream = %feed.name(), "feed opened");
        {
            let mut feeds = self.feeds.lock();
            feeds.retain(|tracked| !tracked.state().can_start());
            feeds.push(Arc::new(feed.clone()));
        }
        Ok(feed)
    }

    /// Number of feeds tracked for teardown.  Ended feeds linger until the
    /// next [`open_feed`][Self::open_feed].
    pub fn feed_count(&self) -> usize {
        self.feeds.lock().len()
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Cancel the active action, release control and end every stream.
    ///
    /// Channel failures during teardown are swallowed.  The session stays
    /// usable; the next request reopens what it needs.
    pub async fn disconnect(&self) {
        self.actions.shutdown().await;
        self.arbiter.disconnect().await;
        let feeds = std::mem::take(&mut *self.feeds.lock());
        for feed in &feeds {
            feed.end().await;
        }
        info!(feeds = feeds.len(), "device session disconnected");
    }
}
