// Command domain model - device tokens, the command table and input validation
use std::fmt;
use thiserror::Error;

pub const MIN_PULSE_WIDTH_MS: f64 = 0.1;
pub const MAX_PULSE_WIDTH_MS: f64 = 100.0;

/// Token that puts the device into "set pulse width" mode.
pub const PULSE_WIDTH_MODE_TOKEN: &str = "p";
/// Token that requests a `[STATUS]` report.
pub const STATUS_TOKEN: &str = "i";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("invalid pulse width {0}: must be between 0.1 and 100 ms")]
    PulseWidthOutOfRange(f64),
    #[error("pulse width '{0}' is not a number")]
    PulseWidthNotNumeric(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

/// Pulse width in milliseconds, guaranteed to be inside the device's accepted range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseWidth(f64);

impl PulseWidth {
    pub fn new(ms: f64) -> Result<Self, ValidationError> {
        // NaN fails both comparisons
        if (MIN_PULSE_WIDTH_MS..=MAX_PULSE_WIDTH_MS).contains(&ms) {
            Ok(Self(ms))
        } else {
            Err(ValidationError::PulseWidthOutOfRange(ms))
        }
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let ms: f64 = trimmed
            .parse()
            .map_err(|_| ValidationError::PulseWidthNotNumeric(trimmed.to_string()))?;
        Self::new(ms)
    }

    pub fn millis(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for PulseWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub token: &'static str,
    pub description: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "fire1", token: "1", description: "Fire injector 1 once" },
    CommandSpec { name: "fire2", token: "2", description: "Fire injector 2 once" },
    CommandSpec { name: "fire3", token: "3", description: "Fire injector 3 once" },
    CommandSpec { name: "fire4", token: "4", description: "Fire injector 4 once" },
    CommandSpec { name: "fire-all", token: "5", description: "Fire all injectors individually" },
    CommandSpec { name: "burst1", token: "q", description: "Fire injector 1 repeatedly" },
    CommandSpec { name: "burst2", token: "w", description: "Fire injector 2 repeatedly" },
    CommandSpec { name: "burst3", token: "e", description: "Fire injector 3 repeatedly" },
    CommandSpec { name: "burst4", token: "r", description: "Fire injector 4 repeatedly" },
    CommandSpec { name: "ph1", token: "a", description: "Fire injector 1 once (P&H)" },
    CommandSpec { name: "ph2", token: "s", description: "Fire injector 2 once (P&H)" },
    CommandSpec { name: "ph3", token: "d", description: "Fire injector 3 once (P&H)" },
    CommandSpec { name: "ph4", token: "f", description: "Fire injector 4 once (P&H)" },
    CommandSpec { name: "ph-burst1", token: "z", description: "Fire injector 1 repeatedly (P&H)" },
    CommandSpec { name: "ph-burst2", token: "x", description: "Fire injector 2 repeatedly (P&H)" },
    CommandSpec { name: "ph-burst3", token: "c", description: "Fire injector 3 repeatedly (P&H)" },
    CommandSpec { name: "ph-burst4", token: "v", description: "Fire injector 4 repeatedly (P&H)" },
    CommandSpec { name: "sequential", token: "t", description: "All injectors sequentially" },
    CommandSpec { name: "ph-sequential-once", token: "g", description: "All injectors once (P&H)" },
    CommandSpec { name: "ph-sequential", token: "b", description: "All injectors sequentially (P&H)" },
    CommandSpec { name: "pulse-width", token: PULSE_WIDTH_MODE_TOKEN, description: "Enter set pulse width mode" },
    CommandSpec { name: "calibrate", token: "k", description: "Calibrate current sensors" },
    CommandSpec { name: "toggle-logging", token: "l", description: "Toggle SD current logging" },
    CommandSpec { name: "dump-logs", token: "m", description: "Dump log files from SD card" },
    CommandSpec { name: "status", token: STATUS_TOKEN, description: "Get status info (JSON)" },
    CommandSpec { name: "offsets", token: "o", description: "Get sensor offsets" },
    CommandSpec { name: "help", token: "h", description: "Show device help" },
];

/// Lookup from logical command names to the tokens the device understands.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTable;

impl CommandTable {
    pub fn lookup(&self, name: &str) -> Result<&'static CommandSpec, ValidationError> {
        let name = name.trim();
        COMMANDS
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ValidationError::UnknownCommand(name.to_string()))
    }

    pub fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_width_bounds_are_inclusive() {
        assert!(PulseWidth::new(0.1).is_ok());
        assert!(PulseWidth::new(100.0).is_ok());
        assert_eq!(
            PulseWidth::new(0.09),
            Err(ValidationError::PulseWidthOutOfRange(0.09))
        );
        assert!(PulseWidth::new(100.1).is_err());
        assert!(PulseWidth::new(f64::NAN).is_err());
    }

    #[test]
    fn test_pulse_width_parse() {
        assert_eq!(PulseWidth::parse(" 2.5 ").unwrap().to_string(), "2.5");
        assert_eq!(PulseWidth::parse("100").unwrap().to_string(), "100");
        assert_eq!(
            PulseWidth::parse("fast"),
            Err(ValidationError::PulseWidthNotNumeric("fast".to_string()))
        );
    }

    #[test]
    fn test_command_table_lookup() {
        let table = CommandTable;
        assert_eq!(table.lookup("fire2").unwrap().token, "2");
        assert_eq!(table.lookup("PH-BURST4").unwrap().token, "v");
        assert_eq!(table.lookup("status").unwrap().token, STATUS_TOKEN);
        assert!(matches!(
            table.lookup("explode"),
            Err(ValidationError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_command_tokens_are_unique() {
        let table = CommandTable;
        let mut tokens: Vec<_> = table.commands().iter().map(|c| c.token).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), table.commands().len());
    }
}
