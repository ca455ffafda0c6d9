use std::fmt;

use super::crc::Crc16;
use crate::utils::error::ModbusError;

/// Station address answered when nothing else is configured.
pub const DEFAULT_STATION_ADDRESS: u8 = 0x01;
pub const MAX_STATION_ADDRESS: u8 = 247;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Bytes following the function code for both supported requests:
/// two 16-bit big-endian fields.
pub const FIXED_PAYLOAD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StationAddress(u8);

impl StationAddress {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for StationAddress {
    type Error = ModbusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        // 0 is broadcast, 248..=255 are reserved
        if value == 0 || value > MAX_STATION_ADDRESS {
            return Err(ModbusError::InvalidStation(value));
        }
        Ok(Self(value))
    }
}

impl Default for StationAddress {
    fn default() -> Self {
        Self(DEFAULT_STATION_ADDRESS)
    }
}

impl fmt::Display for StationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteSingleRegister,
    Unsupported(u8),
}

impl FunctionCode {
    pub fn value(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            FunctionCode::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            FunctionCode::Unsupported(code) => code,
        }
    }
}

impl From<u8> for FunctionCode {
    fn from(code: u8) -> Self {
        match code {
            FC_READ_HOLDING_REGISTERS => FunctionCode::ReadHoldingRegisters,
            FC_WRITE_SINGLE_REGISTER => FunctionCode::WriteSingleRegister,
            other => FunctionCode::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    InvalidFunction = 0x01,
    InvalidAddress = 0x02,
    InvalidData = 0x03,
}

impl ExceptionCode {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::InvalidFunction => write!(f, "invalid function"),
            ExceptionCode::InvalidAddress => write!(f, "invalid address"),
            ExceptionCode::InvalidData => write!(f, "invalid data"),
        }
    }
}

/// A CRC-valid request addressed to this station, after range validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveRequest {
    ReadHoldingRegisters { address: u8, count: u8 },
    WriteSingleRegister { address: u8, value: u8 },
}

impl SlaveRequest {
    /// Narrows the two 16-bit protocol fields to the 8-bit register space.
    ///
    /// The address high byte is checked before the count/data high byte, so a
    /// frame with both set reports `InvalidAddress`.
    pub fn from_fields(
        function: FunctionCode,
        fields: [u8; FIXED_PAYLOAD_LEN],
    ) -> Result<Self, ExceptionCode> {
        let [addr_hi, addr_lo, value_hi, value_lo] = fields;

        match function {
            FunctionCode::Unsupported(_) => Err(ExceptionCode::InvalidFunction),
            _ if addr_hi != 0 => Err(ExceptionCode::InvalidAddress),
            _ if value_hi != 0 => Err(ExceptionCode::InvalidData),
            FunctionCode::ReadHoldingRegisters => Ok(SlaveRequest::ReadHoldingRegisters {
                address: addr_lo,
                count: value_lo,
            }),
            FunctionCode::WriteSingleRegister => Ok(SlaveRequest::WriteSingleRegister {
                address: addr_lo,
                value: value_lo,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveResponse {
    /// Register values in read order; each is sent as a `0x00` high byte
    /// followed by the stored byte.
    ReadHoldingRegisters { values: Vec<u8> },
    WriteSingleRegister { address: u8, value: u8 },
    Exception { function: u8, code: ExceptionCode },
}

impl SlaveResponse {
    pub fn exception(function: FunctionCode, code: ExceptionCode) -> Self {
        SlaveResponse::Exception {
            function: function.value(),
            code,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, SlaveResponse::Exception { .. })
    }

    /// Frame body without the CRC trailer.
    pub fn body(&self, station: StationAddress) -> Vec<u8> {
        let id = station.get();

        match self {
            SlaveResponse::ReadHoldingRegisters { values } => {
                let mut body = Vec::with_capacity(3 + values.len() * 2);
                body.push(id);
                body.push(FC_READ_HOLDING_REGISTERS);
                // Byte count is a single byte on the wire
                body.push((values.len() as u8).wrapping_mul(2));
                for &value in values {
                    body.push(0x00);
                    body.push(value);
                }
                body
            }
            SlaveResponse::WriteSingleRegister { address, value } => {
                vec![id, FC_WRITE_SINGLE_REGISTER, 0x00, *address, 0x00, *value]
            }
            SlaveResponse::Exception { function, code } => {
                vec![id, function | EXCEPTION_FLAG, code.value()]
            }
        }
    }
}

/// Master-side request frame, used by host tooling to talk to a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterRequest {
    ReadHoldingRegisters { station: u8, address: u16, count: u16 },
    WriteSingleRegister { station: u8, address: u16, value: u16 },
}

impl MasterRequest {
    pub fn encode(&self) -> Vec<u8> {
        let (station, function, first, second) = match *self {
            MasterRequest::ReadHoldingRegisters { station, address, count } => {
                (station, FC_READ_HOLDING_REGISTERS, address, count)
            }
            MasterRequest::WriteSingleRegister { station, address, value } => {
                (station, FC_WRITE_SINGLE_REGISTER, address, value)
            }
        };

        let mut frame = vec![station, function];
        frame.extend_from_slice(&first.to_be_bytes());
        frame.extend_from_slice(&second.to_be_bytes());
        append_crc(&mut frame);
        frame
    }
}

/// Appends the CRC16/MODBUS of `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let mut crc = Crc16::new();
    crc.update(frame);
    frame.extend_from_slice(&crc.trailer());
}
