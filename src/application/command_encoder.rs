// Command encoder - frames outbound tokens and sequences multi-step device commands
use crate::domain::command::{PulseWidth, ValidationError, PULSE_WIDTH_MODE_TOKEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Frame a token as one line: the trimmed token plus a single `\n`.
pub fn encode(token: &str) -> Result<Bytes, ValidationError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }

    let mut frame = BytesMut::with_capacity(token.len() + 1);
    frame.put_slice(token.as_bytes());
    frame.put_u8(b'\n');
    Ok(frame.freeze())
}

/// A frame to write once `delay` has elapsed since the previous step.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledWrite {
    pub delay: Duration,
    pub frame: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    /// Mode-select token not yet sent.
    AwaitingModeAck,
    /// Mode token sent; value goes out after the processing gap.
    AwaitingValueSend,
    Done,
}

/// Two-step "set pulse width" exchange: `p`, a processing gap, then the value.
#[derive(Debug, Clone)]
pub struct PulseWidthSequence {
    value: PulseWidth,
    gap: Duration,
    phase: SequencePhase,
}

impl PulseWidthSequence {
    pub fn new(value: PulseWidth, gap: Duration) -> Self {
        Self {
            value,
            gap,
            phase: SequencePhase::AwaitingModeAck,
        }
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }
}

impl Iterator for PulseWidthSequence {
    type Item = ScheduledWrite;

    fn next(&mut self) -> Option<ScheduledWrite> {
        match self.phase {
            SequencePhase::AwaitingModeAck => {
                self.phase = SequencePhase::AwaitingValueSend;
                let frame = encode(PULSE_WIDTH_MODE_TOKEN).ok()?;
                Some(ScheduledWrite {
                    delay: Duration::ZERO,
                    frame,
                })
            }
            SequencePhase::AwaitingValueSend => {
                self.phase = SequencePhase::Done;
                let frame = encode(&self.value.to_string()).ok()?;
                Some(ScheduledWrite {
                    delay: self.gap,
                    frame,
                })
            }
            SequencePhase::Done => None,
        }
    }
}
