//! Transport seams.
//!
//! botlink never speaks to the wire itself.  The connection module that owns
//! the authenticated channel implements these traits, one instance per
//! device endpoint, and the stream loops drive them.
//!
//! - [`ServerStreamCall`] – a server-streaming endpoint (camera, audio,
//!   telemetry).
//! - [`DuplexCall`] – a bidirectional endpoint (behavior control, audio
//!   playback).  Shaped like a gRPC bidi call: the outbound direction is a
//!   stream handed to `open`.
//! - [`ActionChannel`] – unary action commands plus cancel-by-tag.

use async_trait::async_trait;
use botlink_types::{ActionCompletion, ActionRequest, ActionTag, LinkError};
use futures_util::stream::BoxStream;

/// Inbound half of a streaming call.  Ends with `None` on a normal close.
pub type InboundStream<M> = BoxStream<'static, Result<M, LinkError>>;

/// Outbound half of a duplex call.  Ends when the loop closes.
pub type OutboundStream<M> = BoxStream<'static, M>;

/// A server-streaming endpoint.
#[async_trait]
pub trait ServerStreamCall<M>: Send + Sync {
    /// Open a fresh call.  Resolves once the call is established.
    async fn open(&self) -> Result<InboundStream<M>, LinkError>;
}

/// A bidirectional streaming endpoint.
#[async_trait]
pub trait DuplexCall<O, I>: Send + Sync {
    /// Open a fresh call whose outbound messages are read from `outbound`.
    async fn open(&self, outbound: OutboundStream<O>) -> Result<InboundStream<I>, LinkError>;
}

/// Unary action endpoint.
///
/// `run` resolves when the device reports the action finished, whatever the
/// outcome.  `cancel` asks the device to stop the action carrying `tag`.
#[async_trait]
pub trait ActionChannel<P>: Send + Sync {
    async fn run(&self, request: ActionRequest<P>) -> Result<ActionCompletion, LinkError>;

    async fn cancel(&self, tag: ActionTag) -> Result<(), LinkError>;
}
