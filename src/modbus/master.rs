use log::{debug, error, info};

use super::frame::FrameReader;
use super::protocol::{MasterRequest, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use super::transport::{ByteSink, ByteSource};
use crate::utils::error::ModbusError;

/// Largest register count a single Read Holding Registers request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

/// Synchronous Modbus RTU master: one request out, one reply read back and
/// checked for length, CRC and echo.
pub struct ModbusMaster<T: ByteSource + ByteSink> {
    transport: T,
}

impl<T: ByteSource + ByteSink> ModbusMaster<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn read_holding_registers(&mut self, station: u8, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ModbusError::InvalidRequest(format!(
                "register count {} outside 1-{}",
                count, MAX_READ_COUNT
            )));
        }
        info!("📊 Reading {} registers from device {} starting at address {}", count, station, address);

        self.send(MasterRequest::ReadHoldingRegisters { station, address, count })?;

        let mut reader = FrameReader::new(&mut self.transport);
        read_header(&mut reader, station, FC_READ_HOLDING_REGISTERS)?;

        let byte_count = reader.read_byte()? as usize;
        if byte_count != 2 * count as usize {
            error!("❌ Expected {} data bytes, device announced {}", 2 * count, byte_count);
            return Err(ModbusError::InvalidResponse);
        }
        let mut data = vec![0u8; byte_count];
        for slot in data.iter_mut() {
            *slot = reader.read_byte()?;
        }
        check_trailer(&mut reader)?;

        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn write_single_register(&mut self, station: u8, address: u16, value: u16) -> Result<(), ModbusError> {
        info!("✍️  Writing {} to register {} on device {}", value, address, station);

        self.send(MasterRequest::WriteSingleRegister { station, address, value })?;

        let mut reader = FrameReader::new(&mut self.transport);
        read_header(&mut reader, station, FC_WRITE_SINGLE_REGISTER)?;
        let echo = reader.read_array::<4>()?;
        check_trailer(&mut reader)?;

        let [addr_hi, addr_lo] = address.to_be_bytes();
        let [value_hi, value_lo] = value.to_be_bytes();
        if echo != [addr_hi, addr_lo, value_hi, value_lo] {
            error!("❌ Write echo {} does not match the request", hex::encode_upper(echo));
            return Err(ModbusError::InvalidResponse);
        }
        Ok(())
    }

    fn send(&mut self, request: MasterRequest) -> Result<(), ModbusError> {
        let mut stale = 0;
        while self.transport.try_receive()?.is_some() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale bytes before sending", stale);
        }

        for byte in request.encode() {
            self.transport.send(byte)?;
        }
        self.transport.flush()
    }
}

/// Reads station and function code; an exception reply is read to the end
/// and turned into `ModbusError::SlaveException`.
fn read_header<R: ByteSource + ?Sized>(
    reader: &mut FrameReader<'_, R>,
    station: u8,
    function: u8,
) -> Result<(), ModbusError> {
    let replied_station = reader.read_byte()?;
    if replied_station != station {
        error!("❌ Reply from station {} while waiting for {}", replied_station, station);
        return Err(ModbusError::InvalidResponse);
    }

    let replied_function = reader.read_byte()?;
    if replied_function == function | EXCEPTION_FLAG {
        let code = reader.read_byte()?;
        check_trailer(reader)?;
        error!("❌ Device {} rejected function 0x{:02X} with exception 0x{:02X}", station, function, code);
        return Err(ModbusError::SlaveException { function, code });
    }
    if replied_function != function {
        error!("❌ Reply carries function 0x{:02X}, expected 0x{:02X}", replied_function, function);
        return Err(ModbusError::InvalidResponse);
    }
    Ok(())
}

fn check_trailer<R: ByteSource + ?Sized>(reader: &mut FrameReader<'_, R>) -> Result<(), ModbusError> {
    let (crc_lo, crc_hi) = reader.read_trailer()?;
    let crc = reader.crc();
    if !crc.matches(crc_lo, crc_hi) {
        error!(
            "❌ Reply CRC 0x{:04X} does not match computed 0x{:04X}",
            u16::from_le_bytes([crc_lo, crc_hi]),
            crc.value()
        );
        return Err(ModbusError::CrcError);
    }
    Ok(())
}
