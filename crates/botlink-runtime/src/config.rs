//! Session configuration – an optional TOML file plus `BOTLINK_*` overrides.
//!
//! ```toml
//! [control]
//! default_priority = "reserve_control"
//! request_timeout_ms = 10000
//! auto_reacquire = true
//!
//! [actions]
//! first_tag = 2000001
//! last_tag = 3000000
//!
//! [streams]
//! event_capacity = 256
//!
//! [telemetry]
//! log_level = "info,botlink_kernel=debug"
//! log_format = "json"
//!
//! [motion]
//! speed_mmps = 150.0
//! is_custom = true
//! ```
//!
//! Every key is optional.

use std::fs;
use std::path::Path;
use std::time::Duration;

use botlink_kernel::{ArbiterConfig, TagRange};
use botlink_types::{FIRST_SDK_TAG, LAST_SDK_TAG, LinkError, Priority};
use serde::{Deserialize, Serialize};

use crate::capabilities::MotionProfile;
use crate::telemetry::TelemetryConfig;

/// `[control]` – behavior-control arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Priority used when a caller does not pick one.
    #[serde(default)]
    pub default_priority: Priority,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Ask for control again after the device revokes it.
    #[serde(default)]
    pub auto_reacquire: bool,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            default_priority: Priority::default(),
            request_timeout_ms: default_request_timeout_ms(),
            auto_reacquire: false,
        }
    }
}

impl ControlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            request_timeout: self.request_timeout(),
            auto_reacquire: self.auto_reacquire,
        }
    }
}

/// `[actions]` – tag range for SDK-issued actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_first_tag")]
    pub first_tag: u32,

    #[serde(default = "default_last_tag")]
    pub last_tag: u32,
}

fn default_first_tag() -> u32 {
    FIRST_SDK_TAG
}
fn default_last_tag() -> u32 {
    LAST_SDK_TAG
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            first_tag: default_first_tag(),
            last_tag: default_last_tag(),
        }
    }
}

impl ActionConfig {
    pub fn tag_range(&self) -> Result<TagRange, LinkError> {
        TagRange::new(self.first_tag, self.last_tag)
    }
}

/// `[streams]` – event fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Events buffered per bus topic for hand-off subscribers.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

/// Everything a [`DeviceSession`][crate::session::DeviceSession] needs
/// besides the link itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub actions: ActionConfig,

    #[serde(default)]
    pub streams: StreamConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub motion: MotionProfile,
}

impl SessionConfig {
    /// Parse a TOML document.  Does not apply environment overrides.
    pub fn from_toml(raw: &str) -> Result<Self, LinkError> {
        toml::from_str(raw).map_err(|e| LinkError::Config(format!("Failed to parse config: {e}")))
    }

    /// Reject settings no session can run with.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.control.request_timeout_ms == 0 {
            return Err(LinkError::Config(
                "control.request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.streams.event_capacity == 0 {
            return Err(LinkError::Config(
                "streams.event_capacity must be greater than zero".into(),
            ));
        }
        self.actions.tag_range()?;
        self.motion.validate()
    }
}

/// Load the config from `path`.  Returns `Ok(None)` if the file does not
/// exist.  Environment overrides are applied and the result is validated.
pub fn load_from(path: &Path) -> Result<Option<SessionConfig>, LinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        LinkError::Config(format!("Failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg = SessionConfig::from_toml(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Like [`load_from`], falling back to defaults (with overrides) when the
/// file is absent.
pub fn load_or_default(path: &Path) -> Result<SessionConfig, LinkError> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = SessionConfig::default();
            apply_env_overrides(&mut cfg);
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

/// Apply `BOTLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BOTLINK_CONTROL_TIMEOUT_MS` | `control.request_timeout_ms` |
/// | `BOTLINK_CONTROL_PRIORITY` | `control.default_priority` |
/// | `BOTLINK_AUTO_REACQUIRE` | `control.auto_reacquire` |
/// | `BOTLINK_LOG_LEVEL` | `telemetry.log_level` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut SessionConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut SessionConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BOTLINK_CONTROL_TIMEOUT_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.control.request_timeout_ms = ms;
    }
    if let Some(v) = lookup("BOTLINK_CONTROL_PRIORITY")
        && let Ok(priority) = v.parse::<Priority>()
    {
        cfg.control.default_priority = priority;
    }
    if let Some(v) = lookup("BOTLINK_AUTO_REACQUIRE") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => cfg.control.auto_reacquire = true,
            "0" | "false" | "no" | "off" => cfg.control.auto_reacquire = false,
            _ => {}
        }
    }
    if let Some(v) = lookup("BOTLINK_LOG_LEVEL") {
        cfg.telemetry.log_level = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogFormat;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = SessionConfig::from_toml("").unwrap();
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.control.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.actions.tag_range().unwrap(), TagRange::sdk());
        assert_eq!(cfg.streams.event_capacity, 256);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sections_parse() {
        let cfg = SessionConfig::from_toml(
            r#"
            [control]
            default_priority = "override_behaviors"
            request_timeout_ms = 2500
            auto_reacquire = true

            [actions]
            first_tag = 10
            last_tag = 20

            [telemetry]
            log_format = "json"

            [motion]
            speed_mmps = 150.0
            is_custom = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.control.default_priority, Priority::OverrideBehaviors);
        assert_eq!(
            cfg.control.arbiter_config(),
            ArbiterConfig {
                request_timeout: Duration::from_millis(2500),
                auto_reacquire: true,
            }
        );
        assert_eq!(cfg.actions.tag_range().unwrap().size(), 11);
        assert_eq!(cfg.telemetry.log_format, LogFormat::Json);
        assert_eq!(cfg.telemetry.log_level, "info");
        assert_eq!(cfg.motion.speed_mmps, 150.0);
        assert_eq!(cfg.motion.dock_speed_mmps, MotionProfile::default().dock_speed_mmps);
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        let err = SessionConfig::from_toml("[control]\nrequest_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut cfg = SessionConfig::default();
        cfg.control.request_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.actions.first_tag = 50;
        cfg.actions.last_tag = 40;
        assert!(matches!(cfg.validate(), Err(LinkError::Config(_))));

        let mut cfg = SessionConfig::default();
        cfg.streams.event_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = SessionConfig::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("BOTLINK_CONTROL_TIMEOUT_MS", "750"),
                ("BOTLINK_CONTROL_PRIORITY", "reserve-control"),
                ("BOTLINK_AUTO_REACQUIRE", "yes"),
                ("BOTLINK_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(cfg.control.request_timeout_ms, 750);
        assert_eq!(cfg.control.default_priority, Priority::ReserveControl);
        assert!(cfg.control.auto_reacquire);
        assert_eq!(cfg.telemetry.log_level, "debug");
    }

    #[test]
    fn unparseable_overrides_are_ignored() {
        let mut cfg = SessionConfig::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("BOTLINK_CONTROL_TIMEOUT_MS", "ten seconds"),
                ("BOTLINK_CONTROL_PRIORITY", "maximum"),
                ("BOTLINK_AUTO_REACQUIRE", "maybe"),
            ]),
        );
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("botlink.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn load_from_reads_and_validates() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("botlink.toml");

        std::fs::write(&path, "[actions]\nfirst_tag = 7\nlast_tag = 9\n")?;
        let cfg = load_from(&path)?.ok_or("config missing")?;
        assert_eq!(cfg.actions.tag_range()?.first(), 7);

        std::fs::write(&path, "[actions]\nfirst_tag = 9\nlast_tag = 7\n")?;
        assert!(matches!(load_from(&path), Err(LinkError::Config(_))));
        Ok(())
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = load_or_default(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg.actions, ActionConfig::default());
    }
}
