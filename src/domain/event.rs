// Device event domain models - one decoded event per protocol line

/// Parameter report sent by the device in response to the `i` command.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub pulse_width_ms: f64,
    pub peak_time_ms: f64,
    pub hold_freq_hz: f64,
    pub hold_duty_pct: f64,
    pub sd_available: bool,
    pub logging: bool,
    /// Active SD log file, only reported while logging.
    pub log_file: Option<String>,
    /// Current-sensor calibration offsets in volts, one per channel.
    pub sensor_offsets: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdState {
    NotAvailable,
    Ready,
    Logging,
}

impl SdState {
    pub fn label(&self) -> &'static str {
        match self {
            SdState::NotAvailable => "NOT AVAILABLE",
            SdState::Ready => "READY",
            SdState::Logging => "LOGGING",
        }
    }
}

impl StatusReport {
    pub fn sd_state(&self) -> SdState {
        match (self.sd_available, self.logging) {
            (false, _) => SdState::NotAvailable,
            (true, false) => SdState::Ready,
            (true, true) => SdState::Logging,
        }
    }

    /// One-line summary in the form the bench console shows it.
    pub fn summary(&self) -> String {
        format!(
            "Status: Pulse={}ms, SD={}",
            self.pulse_width_ms,
            self.sd_state().label()
        )
    }
}

/// Current measurement for a single firing of one injector.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectorResult {
    pub injector_id: i64,
    pub peak_current_a: f64,
    pub avg_current_a: f64,
    pub peak_hold_mode: bool,
}

impl InjectorResult {
    pub fn mode_label(&self) -> &'static str {
        if self.peak_hold_mode { "P&H" } else { "Normal" }
    }

    pub fn summary(&self) -> String {
        format!(
            "Injector {} ({}): Peak={:.2}A, Avg={:.2}A",
            self.injector_id,
            self.mode_label(),
            self.peak_current_a,
            self.avg_current_a
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(StatusReport),
    Result(InjectorResult),
    ErrorText(String),
    LogText(String),
    /// Untagged line; may still have carried a parameter hint.
    PlainText(String),
    /// Tagged line whose payload could not be decoded.
    ParseFailure { raw: String, reason: String },
}
