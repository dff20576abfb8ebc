// Parameter snapshot domain model - last-known device configuration values

pub const UNKNOWN_PARAMETER: &str = "--";
pub const UNKNOWN_POT: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSnapshot {
    pub pulse_width: String,
    pub peak_time: String,
    pub hold_duty: String,
    pub hold_freq: String,
    pub pots: [String; 4],
}

impl Default for ParameterSnapshot {
    fn default() -> Self {
        Self {
            pulse_width: UNKNOWN_PARAMETER.to_string(),
            peak_time: UNKNOWN_PARAMETER.to_string(),
            hold_duty: UNKNOWN_PARAMETER.to_string(),
            hold_freq: UNKNOWN_PARAMETER.to_string(),
            pots: std::array::from_fn(|_| UNKNOWN_POT.to_string()),
        }
    }
}

/// A single-field update recovered from the device's plain-text output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterHint {
    /// Milliseconds, kept exactly as the device printed them.
    PulseWidth(String),
    PeakTime(String),
    /// Hertz, already rounded to an integer.
    HoldFreq(i64),
}

/// Render a reading with its unit, e.g. `2.5 ms` or `400 Hz`.
pub fn with_unit(value: f64, unit: &str) -> String {
    format!("{} {}", value, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fully_seeded() {
        let snapshot = ParameterSnapshot::default();
        assert_eq!(snapshot.pulse_width, "--");
        assert_eq!(snapshot.hold_freq, "--");
        assert!(snapshot.pots.iter().all(|p| p == "---"));
    }

    #[test]
    fn test_with_unit_uses_shortest_form() {
        assert_eq!(with_unit(1.0, "ms"), "1 ms");
        assert_eq!(with_unit(2.5, "ms"), "2.5 ms");
        assert_eq!(with_unit(50.0, "%"), "50 %");
    }
}
