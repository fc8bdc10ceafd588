//! `botlink-kernel` – Ownership & Correlation
//!
//! Decides who may command the device and keeps in-flight commands
//! correlated.  It never touches the wire; both components sit on top of
//! the seams in `botlink-middleware`.
//!
//! # Modules
//!
//! - [`control_arbiter`] – [`ControlArbiter`][control_arbiter::ControlArbiter]:
//!   the behavior-control request/release protocol over one duplex stream.
//!   Tracks [`ControlState`][botlink_types::ControlState], publishes
//!   granted/lost notifications, and drops to `Unowned` whenever the stream
//!   goes away.
//! - [`action_tags`] – [`ActionTagAllocator`][action_tags::ActionTagAllocator]:
//!   a wrapping tag counter confined to a reserved range, paired with a
//!   single-active-action policy and cancel-by-tag.

pub mod action_tags;
pub mod control_arbiter;

pub use action_tags::{ActionTagAllocator, TagRange};
pub use control_arbiter::{ArbiterConfig, CONTROL_STREAM, ControlArbiter};
