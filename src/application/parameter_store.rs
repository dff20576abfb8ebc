// Parameter store - last-known device parameters, published as whole snapshots
use crate::application::decoder::extract_hint;
use crate::domain::event::{Event, StatusReport};
use crate::domain::parameters::{with_unit, ParameterHint, ParameterSnapshot};
use tokio::sync::watch;

/// Single writer (the read loop), any number of readers.
///
/// Every update is applied inside one `send_modify`, so readers only ever see the
/// snapshot from before or after an event, never a mix.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    tx: watch::Sender<ParameterSnapshot>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ParameterSnapshot::default()),
        }
    }

    pub fn apply_status(&self, status: &StatusReport) {
        self.tx.send_modify(|p| {
            p.pulse_width = with_unit(status.pulse_width_ms, "ms");
            p.peak_time = with_unit(status.peak_time_ms, "ms");
            p.hold_freq = with_unit(status.hold_freq_hz, "Hz");
            p.hold_duty = with_unit(status.hold_duty_pct, "%");
        });
    }

    pub fn apply_hint(&self, hint: ParameterHint) {
        self.tx.send_modify(|p| match hint {
            ParameterHint::PulseWidth(ms) => p.pulse_width = format!("{} ms", ms),
            ParameterHint::PeakTime(ms) => p.peak_time = format!("{} ms", ms),
            ParameterHint::HoldFreq(hz) => p.hold_freq = format!("{} Hz", hz),
        });
    }

    /// Fold a decoded event into the store. Returns whether anything was written.
    pub fn apply_event(&self, event: &Event) -> bool {
        match event {
            Event::Status(status) => {
                self.apply_status(status);
                true
            }
            Event::PlainText(line) => match extract_hint(line) {
                Some(hint) => {
                    self.apply_hint(hint);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ParameterSnapshot> {
        self.tx.subscribe()
    }

    pub fn reset(&self) {
        self.tx.send_replace(ParameterSnapshot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::decoder::classify;

    fn status(pulse_width_ms: f64) -> StatusReport {
        StatusReport {
            pulse_width_ms,
            peak_time_ms: 1.0,
            hold_freq_hz: 400.0,
            hold_duty_pct: 50.0,
            sd_available: true,
            logging: false,
            log_file: None,
            sensor_offsets: None,
        }
    }

    #[test]
    fn test_status_line_updates_all_four_fields() {
        let store = ParameterStore::new();
        let event = classify(
            r#"[STATUS]{"pulseWidth":2.5,"peakTime":1.0,"holdFreq":400,"holdDuty":50,"sdAvailable":true,"logging":false}"#,
        );
        assert!(store.apply_event(&event));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.pulse_width, "2.5 ms");
        assert_eq!(snapshot.peak_time, "1 ms");
        assert_eq!(snapshot.hold_freq, "400 Hz");
        assert_eq!(snapshot.hold_duty, "50 %");
        assert!(snapshot.pots.iter().all(|p| p == "---"));
    }

    #[test]
    fn test_status_overwrites_regardless_of_previous_value() {
        let store = ParameterStore::new();
        store.apply_status(&status(80.0));
        store.apply_status(&status(0.5));
        assert_eq!(store.snapshot().pulse_width, "0.5 ms");
    }

    #[test]
    fn test_plain_text_hint_updates_one_field() {
        let store = ParameterStore::new();
        store.apply_status(&status(2.5));
        assert!(store.apply_event(&classify("Current pulse width: 4.2 ms")));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.pulse_width, "4.2 ms");
        assert_eq!(snapshot.peak_time, "1 ms");
        assert_eq!(snapshot.hold_freq, "400 Hz");
    }

    #[test]
    fn test_hold_frequency_hint_is_rounded() {
        let store = ParameterStore::new();
        store.apply_event(&classify("Hold frequency: 2000.4 Hz"));
        assert_eq!(store.snapshot().hold_freq, "2000 Hz");
    }

    #[test]
    fn test_other_events_leave_store_untouched() {
        let store = ParameterStore::new();
        let before = store.snapshot();
        for line in [
            "[STATUS]{not json}",
            r#"[RESULT]{"injector":1,"peakCurrent":2.0,"avgCurrent":1.0}"#,
            "[ERROR]Current pulse width: 9.9 ms",
            "[LOG]Peak time: 3.0 ms",
            "Firing injector 1 x1",
        ] {
            assert!(!store.apply_event(&classify(line)), "{}", line);
        }
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_subscribers_see_whole_updates() {
        let store = ParameterStore::new();
        let mut rx = store.subscribe();
        store.apply_status(&status(7.5));
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.pulse_width, "7.5 ms");
        assert_eq!(seen.hold_duty, "50 %");
    }

    #[test]
    fn test_reset_restores_placeholders() {
        let store = ParameterStore::new();
        store.apply_status(&status(7.5));
        store.reset();
        assert_eq!(store.snapshot(), ParameterSnapshot::default());
    }
}
