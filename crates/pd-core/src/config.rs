//! Detection settings.
//!
//! Every public detection call takes one [`DetectionConfig`] snapshot from a
//! [`ConfigProvider`] at entry and passes it down, so a configuration change
//! never applies halfway through an event.

use bitflags::bitflags;
use chrono::Duration;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Context fields an operation association may carry over from the previous slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PropagationOption: u8 {
        const WORK_ORDER = 1;
        const COMPONENT = 2;
        const LINE = 4;
        const MANUFACTURING_ORDER = 8;
    }
}

impl PropagationOption {
    pub const fn is_active(self) -> bool {
        !self.is_empty()
    }
}

impl Default for PropagationOption {
    fn default() -> Self {
        Self::all()
    }
}

/// Settings read by the detection components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Largest gap across which an auto-operation keeps the previous operation slot going.
    /// Default: 1 day.
    #[serde(with = "seconds")]
    pub auto_operation_same: Duration,

    /// Largest gap across which the previous component is carried to a new operation.
    /// Default: 1 day.
    #[serde(with = "seconds")]
    pub auto_component_same: Duration,

    /// Largest gap across which the previous work order is carried to a new operation.
    /// Default: 1 day.
    #[serde(with = "seconds")]
    pub auto_work_order_same: Duration,

    /// Margin removed at both ends of a gap before looking for auto-sequence activity in it.
    /// Default: 40 seconds.
    #[serde(with = "seconds")]
    pub auto_operation_margin: Duration,

    /// A partial cycle starting less than this before a new operation slot is moved into it.
    /// Default: 0 seconds.
    #[serde(with = "seconds")]
    pub operation_cycle_association_margin: Duration,

    /// Fields an auto-operation association carries from the previous slot.
    /// Default: all.
    pub auto_operation_propagation: PropagationOption,

    /// Fields an operation extension carries over the extended part.
    /// Default: all.
    pub extend_operation_propagation: PropagationOption,

    /// Guess and apply the next manufacturing order when the operation changes.
    /// Default: false.
    pub manufacturing_order_management: bool,

    /// Push the end of the last full cycle to a new cycle end of the same operation.
    /// Default: false.
    pub extend_full_cycle_when_new_cycle_end: bool,

    /// Never record zero-length between-cycles gaps.
    /// Default: false.
    pub skip_empty_between_cycles: bool,

    /// Skip zero-length gaps that follow a zero-length cycle.
    /// Default: true.
    pub skip_empty_between_if_previous_empty: bool,

    /// Create unknown operations referenced by code in cycle events.
    /// Default: true.
    pub create_operation_from_code: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            auto_operation_same: Duration::days(1),
            auto_component_same: Duration::days(1),
            auto_work_order_same: Duration::days(1),
            auto_operation_margin: Duration::seconds(40),
            operation_cycle_association_margin: Duration::zero(),
            auto_operation_propagation: PropagationOption::all(),
            extend_operation_propagation: PropagationOption::all(),
            manufacturing_order_management: false,
            extend_full_cycle_when_new_cycle_end: false,
            skip_empty_between_cycles: false,
            skip_empty_between_if_previous_empty: true,
            create_operation_from_code: true,
        }
    }
}

/// Source of configuration snapshots.
pub trait ConfigProvider: Send + Sync {
    /// Returns the settings to use for one detection call.
    fn snapshot(&self) -> DetectionConfig;
}

impl ConfigProvider for DetectionConfig {
    fn snapshot(&self) -> DetectionConfig {
        self.clone()
    }
}

/// Serializes a `chrono::Duration` as whole seconds.
mod seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| D::Error::custom(format!("duration out of range: {secs}s")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DetectionConfig::default();
        assert_eq!(config.auto_operation_same, Duration::hours(24));
        assert_eq!(config.auto_operation_margin, Duration::seconds(40));
        assert_eq!(config.operation_cycle_association_margin, Duration::zero());
        assert_eq!(config.auto_operation_propagation, PropagationOption::all());
        assert!(!config.manufacturing_order_management);
        assert!(config.skip_empty_between_if_previous_empty);
        assert!(config.create_operation_from_code);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config: DetectionConfig = serde_json::from_str(
            r#"{"auto_operation_margin": 10, "extend_full_cycle_when_new_cycle_end": true}"#,
        )
        .unwrap();
        assert_eq!(config.auto_operation_margin, Duration::seconds(10));
        assert!(config.extend_full_cycle_when_new_cycle_end);
        assert_eq!(config.auto_component_same, Duration::days(1));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(DetectionConfig::default()).unwrap();
        assert_eq!(json["auto_operation_same"], 86_400);
        assert_eq!(json["operation_cycle_association_margin"], 0);
    }

    #[test]
    fn propagation_option_activity() {
        assert!(PropagationOption::default().is_active());
        assert!(!PropagationOption::empty().is_active());
        let line_only = PropagationOption::LINE;
        assert!(!line_only.contains(PropagationOption::WORK_ORDER));
    }
}
