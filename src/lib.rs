//! Modbus RTU Slave Library
//!
//! This library implements the slave side of Modbus RTU for a field device
//! with an 8-bit register space: silence-delimited frame reception, CRC16
//! validation, Read Holding Registers / Write Single Register dispatch and
//! exception responses. A small synchronous master client sits on the same
//! transport for talking to such a slave. The serial line, the silence timer and the register
//! store are injected, so the engine runs the same against real hardware and
//! against in-memory fakes.

pub mod config;
pub mod modbus;
pub mod devices;
pub mod utils;
pub mod cli;

// Re-export commonly used types
pub use config::Config;
pub use modbus::{
    crc16_modbus, BufferTransport, ByteSink, ByteSource, CycleOutcome, ModbusMaster, SerialTransport,
    SilenceDetector, SilenceTimer, SlaveEngine, StationAddress,
};
pub use devices::{RegisterBackend, RegisterMap};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
