// Message decoder - classifies protocol lines into events and extracts parameter hints
use crate::domain::event::{Event, InjectorResult, StatusReport};
use crate::domain::parameters::ParameterHint;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

const STATUS_TAG: &str = "[STATUS]";
const RESULT_TAG: &str = "[RESULT]";
const ERROR_TAG: &str = "[ERROR]";
const LOG_TAG: &str = "[LOG]";

static PULSE_WIDTH_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Current pulse width: (\d+(?:\.\d+)?) ms").unwrap());
static PEAK_TIME_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Peak time: (\d+(?:\.\d+)?) ms").unwrap());
static HOLD_FREQ_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Hold frequency: (\d+(?:\.\d+)?) Hz").unwrap());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    pulse_width: f64,
    peak_time: f64,
    hold_freq: f64,
    hold_duty: f64,
    sd_available: bool,
    logging: bool,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    offsets: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultPayload {
    injector: i64,
    peak_current: f64,
    avg_current: f64,
    #[serde(default)]
    peak_hold: bool,
}

impl From<StatusPayload> for StatusReport {
    fn from(p: StatusPayload) -> Self {
        Self {
            pulse_width_ms: p.pulse_width,
            peak_time_ms: p.peak_time,
            hold_freq_hz: p.hold_freq,
            hold_duty_pct: p.hold_duty,
            sd_available: p.sd_available,
            logging: p.logging,
            log_file: p.log_file,
            sensor_offsets: p.offsets,
        }
    }
}

impl From<ResultPayload> for InjectorResult {
    fn from(p: ResultPayload) -> Self {
        Self {
            injector_id: p.injector,
            peak_current_a: p.peak_current,
            avg_current_a: p.avg_current,
            peak_hold_mode: p.peak_hold,
        }
    }
}

/// Map one trimmed line to its event. The first matching tag wins.
pub fn classify(line: &str) -> Event {
    if let Some(payload) = line.strip_prefix(STATUS_TAG) {
        decode_json::<StatusPayload>(line, payload)
            .map(|p| Event::Status(p.into()))
            .unwrap_or_else(|failure| failure)
    } else if let Some(payload) = line.strip_prefix(RESULT_TAG) {
        decode_json::<ResultPayload>(line, payload)
            .map(|p| Event::Result(p.into()))
            .unwrap_or_else(|failure| failure)
    } else if let Some(text) = line.strip_prefix(ERROR_TAG) {
        Event::ErrorText(text.to_string())
    } else if let Some(text) = line.strip_prefix(LOG_TAG) {
        Event::LogText(text.to_string())
    } else {
        Event::PlainText(line.to_string())
    }
}

fn decode_json<T: for<'de> Deserialize<'de>>(line: &str, payload: &str) -> Result<T, Event> {
    serde_json::from_str(payload).map_err(|e| Event::ParseFailure {
        raw: line.to_string(),
        reason: e.to_string(),
    })
}

/// Recover a parameter value from the device's legacy help/status text.
///
/// Only the first label found in the line is tried, so a line can update at most
/// one parameter.
pub fn extract_hint(line: &str) -> Option<ParameterHint> {
    if line.contains("Current pulse width:") {
        let caps = PULSE_WIDTH_HINT.captures(line)?;
        Some(ParameterHint::PulseWidth(caps[1].to_string()))
    } else if line.contains("Peak time:") {
        let caps = PEAK_TIME_HINT.captures(line)?;
        Some(ParameterHint::PeakTime(caps[1].to_string()))
    } else if line.contains("Hold frequency:") {
        let caps = HOLD_FREQ_HINT.captures(line)?;
        let hz: f64 = caps[1].parse().ok()?;
        Some(ParameterHint::HoldFreq(hz.round() as i64))
    } else {
        None
    }
}
