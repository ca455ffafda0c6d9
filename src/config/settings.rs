use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::devices::register_map::RegisterPreset;
use crate::modbus::protocol::{StationAddress, DEFAULT_STATION_ADDRESS};
use crate::modbus::silence::silence_ticks;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Protocol settings
    pub station_address: u8,
    pub clock_frequency_hz: u32,        // Tick rate of the silence timer

    // Connection settings
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub read_poll_ms: u64,              // Read timeout between shutdown checks

    // Register space contents at startup, never written back
    pub initial_registers: Vec<RegisterPreset>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    #[default]
    None,
    Even,
    Odd,
}

impl std::str::FromStr for ParityConfig {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(ParityConfig::None),
            "even" | "e" => Ok(ParityConfig::Even),
            "odd" | "o" => Ok(ParityConfig::Odd),
            other => Err(ModbusError::ConfigError(format!("unknown parity '{}'", other))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let serial_port = if cfg!(target_os = "windows") {
            "COM1"
        } else {
            "/dev/ttyUSB0"
        };

        Self {
            station_address: DEFAULT_STATION_ADDRESS,
            clock_frequency_hz: 50_000_000,
            serial_port: serial_port.to_string(),
            baud_rate: 9600,
            parity: ParityConfig::None,
            read_poll_ms: 100,
            initial_registers: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_matches(matches)?;
        Ok(config)
    }

    /// Overrides fields with whatever was given on the command line.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial_port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.baud_rate = parse_number(baud, "baud")?;
        }
        if let Some(station) = matches.get_one::<String>("station") {
            self.station_address = parse_number(station, "station")?;
        }
        if let Some(clock) = matches.get_one::<String>("clock") {
            self.clock_frequency_hz = parse_number(clock, "clock")?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            self.parity = parity.parse()?;
        }
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        info!("📄 Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        self.station()?;
        silence_ticks(self.clock_frequency_hz, self.baud_rate)?;

        if self.serial_port.trim().is_empty() {
            return Err(ModbusError::ConfigError("serial port must be set".to_string()));
        }
        if self.read_poll_ms == 0 {
            return Err(ModbusError::ConfigError("read_poll_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn station(&self) -> Result<StationAddress, ModbusError> {
        StationAddress::try_from(self.station_address)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

/// Accepts decimal or `0x`-prefixed hex.
pub fn parse_number<N>(value: &str, field: &str) -> Result<N, ModbusError>
where
    N: TryFrom<u64>,
{
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    }
    .map_err(|e| ModbusError::ConfigError(format!("invalid {} '{}': {}", field, value, e)))?;

    N::try_from(parsed).map_err(|_| ModbusError::ConfigError(format!("{} '{}' is out of range", field, value)))
}
