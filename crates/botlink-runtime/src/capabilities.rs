//! Per-connection device facts: firmware-gated capabilities and the default
//! motion profile.
//!
//! Both live on the [`DeviceSession`][crate::session::DeviceSession] that
//! owns the connection, never in process-wide state, so two connected
//! devices never see each other's settings.

use botlink_types::{LinkError, Priority};
use semver::Version;
use serde::{Deserialize, Serialize};

/// First firmware that honours [`Priority::ReserveControl`].
pub const RESERVE_CONTROL_SINCE: Version = Version::new(1, 8, 0);

/// What the connected firmware can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    firmware: Version,
}

impl DeviceCapabilities {
    pub fn from_firmware(firmware: Version) -> Self {
        Self { firmware }
    }

    /// Parse a firmware string as reported by the device.
    ///
    /// Accepts a leading `v` and a trailing fourth build component
    /// (`"v1.8.0.6051"` reads as `1.8.0+6051`).
    ///
    /// # Errors
    ///
    /// [`LinkError::Config`] when the string is not a version.
    pub fn parse_firmware(raw: &str) -> Result<Version, LinkError> {
        let trimmed = raw.trim().trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
        let normalized = match parts.as_slice() {
            [major, minor, patch, build] if parts.iter().all(numeric) => {
                format!("{major}.{minor}.{patch}+{build}")
            }
            _ => trimmed.to_string(),
        };
        Version::parse(&normalized)
            .map_err(|e| LinkError::Config(format!("invalid firmware version '{raw}': {e}")))
    }

    pub fn firmware(&self) -> &Version {
        &self.firmware
    }

    pub fn supports_reserve_control(&self) -> bool {
        self.firmware >= RESERVE_CONTROL_SINCE
    }

    /// `Ok(())` when the firmware accepts control requests at `priority`.
    ///
    /// # Errors
    ///
    /// [`LinkError::Unsupported`] for a priority the firmware predates.
    pub fn check_priority(&self, priority: Priority) -> Result<(), LinkError> {
        match priority {
            Priority::ReserveControl if !self.supports_reserve_control() => {
                Err(LinkError::Unsupported(format!(
                    "{priority} priority needs firmware {RESERVE_CONTROL_SINCE} or newer (device runs {})",
                    self.firmware
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Speeds and accelerations applied to motion commands that do not carry
/// their own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub speed_mmps: f32,
    pub accel_mmps2: f32,
    pub decel_mmps2: f32,
    pub point_turn_speed_rad_per_sec: f32,
    pub point_turn_accel_rad_per_sec2: f32,
    pub point_turn_decel_rad_per_sec2: f32,
    pub dock_speed_mmps: f32,
    pub dock_accel_mmps2: f32,
    pub dock_decel_mmps2: f32,
    pub reverse_speed_mmps: f32,
    /// `false` lets the device substitute its own tuned values.
    pub is_custom: bool,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            speed_mmps: 100.0,
            accel_mmps2: 200.0,
            decel_mmps2: 500.0,
            point_turn_speed_rad_per_sec: 2.0,
            point_turn_accel_rad_per_sec2: 10.0,
            point_turn_decel_rad_per_sec2: 10.0,
            dock_speed_mmps: 60.0,
            dock_accel_mmps2: 200.0,
            dock_decel_mmps2: 500.0,
            reverse_speed_mmps: 80.0,
            is_custom: false,
        }
    }
}

impl MotionProfile {
    /// # Errors
    ///
    /// [`LinkError::Config`] naming the first non-positive field.
    pub fn validate(&self) -> Result<(), LinkError> {
        let fields = [
            ("speed_mmps", self.speed_mmps),
            ("accel_mmps2", self.accel_mmps2),
            ("decel_mmps2", self.decel_mmps2),
            ("point_turn_speed_rad_per_sec", self.point_turn_speed_rad_per_sec),
            ("point_turn_accel_rad_per_sec2", self.point_turn_accel_rad_per_sec2),
            ("point_turn_decel_rad_per_sec2", self.point_turn_decel_rad_per_sec2),
            ("dock_speed_mmps", self.dock_speed_mmps),
            ("dock_accel_mmps2", self.dock_accel_mmps2),
            ("dock_decel_mmps2", self.dock_decel_mmps2),
            ("reverse_speed_mmps", self.reverse_speed_mmps),
        ];
        match fields.iter().find(|(_, v)| !(*v > 0.0)) {
            Some((name, value)) => Err(LinkError::Config(format!(
                "motion.{name} must be positive, got {value}"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_firmware_strings() {
        assert_eq!(
            DeviceCapabilities::parse_firmware("v1.8.0.6051").unwrap(),
            Version::parse("1.8.0+6051").unwrap()
        );
        assert_eq!(
            DeviceCapabilities::parse_firmware("2.0.1").unwrap(),
            Version::new(2, 0, 1)
        );
        assert!(matches!(
            DeviceCapabilities::parse_firmware("dev-build"),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn reserve_control_is_firmware_gated() {
        let old = DeviceCapabilities::from_firmware(Version::new(1, 6, 0));
        let new = DeviceCapabilities::from_firmware(Version::new(1, 8, 0));

        assert!(!old.supports_reserve_control());
        assert!(matches!(
            old.check_priority(Priority::ReserveControl),
            Err(LinkError::Unsupported(_))
        ));
        assert!(old.check_priority(Priority::Default).is_ok());
        assert!(old.check_priority(Priority::OverrideBehaviors).is_ok());

        assert!(new.supports_reserve_control());
        assert!(new.check_priority(Priority::ReserveControl).is_ok());
    }

    #[test]
    fn default_motion_profile_is_valid() {
        let profile = MotionProfile::default();
        assert!(profile.validate().is_ok());
        assert!(!profile.is_custom);
    }

    #[test]
    fn non_positive_motion_values_are_rejected() {
        let profile = MotionProfile {
            dock_speed_mmps: 0.0,
            ..MotionProfile::default()
        };
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("dock_speed_mmps"));

        let profile = MotionProfile {
            speed_mmps: f32::NAN,
            ..MotionProfile::default()
        };
        assert!(profile.validate().is_err());
    }
}
