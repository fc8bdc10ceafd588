//! `botlink-runtime` – Session Orchestration
//!
//! Wires the kernel components to one device connection and carries the
//! ambient concerns a host process needs.
//!
//! # Modules
//!
//! - [`session`] – [`DeviceSession`][session::DeviceSession]:
//!   the owner of everything that belongs to one connection (arbiter,
//!   action allocator, feeds, bus, capabilities, motion defaults).
//!   Gates priorities on firmware and refuses actions without control.
//! - [`link`] – [`DeviceLink`][link::DeviceLink]:
//!   the endpoints a session drives, plus
//!   [`LoopbackDevice`][link::LoopbackDevice] for tests and demos.
//! - [`capabilities`] – [`DeviceCapabilities`][capabilities::DeviceCapabilities]
//!   derived from the firmware version, and
//!   [`MotionProfile`][capabilities::MotionProfile].
//! - [`config`] – [`SessionConfig`][config::SessionConfig]:
//!   optional TOML file with `BOTLINK_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.
//!
//! # Example
//!
//! ```rust,no_run
//! use botlink_runtime::{DeviceSession, LoopbackDevice, SessionConfig};
//! use botlink_types::Priority;
//! use semver::Version;
//!
//! # async fn demo() -> Result<(), botlink_types::LinkError> {
//! let device = LoopbackDevice::<String>::new();
//! let session =
//!     DeviceSession::<String>::connect(&device, SessionConfig::default(), Version::new(1, 8, 0))?;
//! if session.request_control(Priority::Default).await? {
//!     session.run_action("dock".to_string()).await?;
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod link;
pub mod session;
pub mod telemetry;

pub use capabilities::{DeviceCapabilities, MotionProfile, RESERVE_CONTROL_SINCE};
pub use config::{SessionConfig, apply_env_overrides, load_from, load_or_default};
pub use link::{DeviceLink, LoopbackDevice};
pub use session::DeviceSession;
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
