use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch")]
    CrcError,

    #[error("Invalid response from device")]
    InvalidResponse,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Device answered function 0x{function:02X} with exception 0x{code:02X}")]
    SlaveException { function: u8, code: u8 },

    #[error("Timeout occurred")]
    Timeout,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Engine shutdown requested")]
    Shutdown,

    #[error("Invalid station address: {0}")]
    InvalidStation(u8),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        ModbusError::ConnectionError(format!("Serial port error: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<hex::FromHexError> for ModbusError {
    fn from(err: hex::FromHexError) -> Self {
        ModbusError::SerializationError(format!("Hex error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::CommunicationError(format!("IO error: {}", err))
    }
}
