//! [`DeviceLink`] – the per-connection endpoints a session drives.
//!
//! The connection module that authenticates the channel hands a
//! `DeviceLink` to [`DeviceSession::connect`][crate::session::DeviceSession::connect].
//! Feeds are opened separately with whatever [`ServerStreamCall`] the
//! feature needs.
//!
//! [`ServerStreamCall`]: botlink_middleware::ServerStreamCall

use std::sync::Arc;

use botlink_middleware::{ActionChannel, DuplexCall, LoopbackActions, LoopbackDuplex};
use botlink_types::{ControlRequest, ControlResponse};

/// Endpoints shared by every feature on one device connection.
pub trait DeviceLink<P>: Send + Sync {
    /// The behavior-control duplex endpoint.
    fn control(&self) -> Arc<dyn DuplexCall<ControlRequest, ControlResponse>>;

    /// The action endpoint carrying `P` parameters.
    fn actions(&self) -> Arc<dyn ActionChannel<P>>;
}

/// In-memory device for tests and demos.
///
/// The control endpoint grants every request unless a different responder
/// is installed on [`control`][Self::control].
pub struct LoopbackDevice<P> {
    pub control: Arc<LoopbackDuplex<ControlRequest, ControlResponse>>,
    pub actions: Arc<LoopbackActions<P>>,
}

impl<P> LoopbackDevice<P> {
    pub fn new() -> Self {
        Self::with_actions(LoopbackActions::new())
    }

    pub fn with_actions(actions: LoopbackActions<P>) -> Self {
        let control = LoopbackDuplex::with_responder(|request: &ControlRequest| match request {
            ControlRequest::Request { .. } => vec![ControlResponse::Granted],
            ControlRequest::Release => Vec::new(),
        });
        Self {
            control: Arc::new(control),
            actions: Arc::new(actions),
        }
    }
}

impl<P> Default for LoopbackDevice<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + 'static> DeviceLink<P> for LoopbackDevice<P> {
    fn control(&self) -> Arc<dyn DuplexCall<ControlRequest, ControlResponse>> {
        self.control.clone()
    }

    fn actions(&self) -> Arc<dyn ActionChannel<P>> {
        self.actions.clone()
    }
}
