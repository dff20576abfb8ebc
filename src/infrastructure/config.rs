use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceConfig {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Poll interval of the blocking reader; bounds how long a close waits on it.
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        let port = if cfg!(windows) { "COM3" } else { "/dev/ttyUSB0" };
        Self {
            port: port.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 50,
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Wait after opening before the first status poll.
    pub settle_delay_ms: u64,
    /// Gap the device needs between `p` and the pulse width value.
    pub pulse_width_gap_ms: u64,
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            pulse_width_gap_ms: 100,
            event_capacity: 256,
        }
    }
}

impl SessionSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn pulse_width_gap(&self) -> Duration {
        Duration::from_millis(self.pulse_width_gap_ms)
    }
}

/// Load `<path>.{toml,json,...}` if present, then apply `INJECTOR_*` overrides,
/// e.g. `INJECTOR_SERIAL__PORT=/dev/ttyACM0`.
pub fn load_device_config(path: &str) -> anyhow::Result<DeviceConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("INJECTOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
