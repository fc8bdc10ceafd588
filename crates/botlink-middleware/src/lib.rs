//! `botlink-middleware` – stream plumbing between the device and the SDK
//!
//! Drives streaming calls without caring what the messages mean.
//!
//! # Modules
//!
//! - [`transport`] – async traits the connection layer implements for each
//!   device endpoint.
//! - [`stream_loop`] – [`StreamLoop`], one background receive loop per
//!   server-streaming call, restartable after it ends.
//! - [`duplex_loop`] – [`DuplexStreamLoop`], a receive loop with an ordered
//!   writer on the same call.
//! - [`pending`] – [`PendingResult`], a settle-once cell that any number of
//!   tasks can await.
//! - [`bus`] – topic-based event bus for lifecycle, control and action
//!   notifications, with inline or hand-off delivery per subscriber.
//! - [`loopback`] – in-memory transports for tests and demos.

pub mod bus;
pub mod duplex_loop;
pub mod loopback;
pub mod pending;
pub mod stream_loop;
pub mod transport;

pub use bus::{EventBus, SubscriptionId, Topic, TopicReceiver};
pub use duplex_loop::DuplexStreamLoop;
pub use loopback::{ActionCall, LoopbackActions, LoopbackDuplex, LoopbackFeed};
pub use pending::{PendingResult, Settlement, Waiter};
pub use stream_loop::{LoopExit, LoopOptions, StreamLifecycle, StreamLoop};
pub use transport::{ActionChannel, DuplexCall, InboundStream, OutboundStream, ServerStreamCall};
