use super::crc::Crc16;
use super::transport::{ByteSink, ByteSource};
use crate::utils::error::ModbusError;

/// Pulls frame bytes off the line, folding each into a fresh CRC.
pub struct FrameReader<'a, R: ByteSource + ?Sized> {
    source: &'a mut R,
    crc: Crc16,
    consumed: usize,
}

impl<'a, R: ByteSource + ?Sized> FrameReader<'a, R> {
    pub fn new(source: &'a mut R) -> Self {
        Self {
            source,
            crc: Crc16::new(),
            consumed: 0,
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, ModbusError> {
        let byte = self.source.receive()?;
        self.crc.push(byte);
        self.consumed += 1;
        Ok(byte)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ModbusError> {
        let mut bytes = [0u8; N];
        for slot in bytes.iter_mut() {
            *slot = self.read_byte()?;
        }
        Ok(bytes)
    }

    /// Reads the two trailer bytes, which are not part of the checksum, and
    /// returns them as `(crc_lo, crc_hi)`.
    pub fn read_trailer(&mut self) -> Result<(u8, u8), ModbusError> {
        let crc_lo = self.source.receive()?;
        let crc_hi = self.source.receive()?;
        self.consumed += 2;
        Ok((crc_lo, crc_hi))
    }

    pub fn crc(&self) -> Crc16 {
        self.crc
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

/// Pushes response bytes onto the line, folding each into a fresh CRC, and
/// closes the frame with the checksum low byte first.
pub struct FrameWriter<'a, W: ByteSink + ?Sized> {
    sink: &'a mut W,
    crc: Crc16,
    written: Vec<u8>,
}

impl<'a, W: ByteSink + ?Sized> FrameWriter<'a, W> {
    pub fn new(sink: &'a mut W) -> Self {
        Self {
            sink,
            crc: Crc16::new(),
            written: Vec::new(),
        }
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), ModbusError> {
        self.sink.send(byte)?;
        self.crc.push(byte);
        self.written.push(byte);
        Ok(())
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(())
    }

    /// Sends the CRC trailer, flushes the sink and returns the whole frame
    /// as transmitted.
    pub fn finish(mut self) -> Result<Vec<u8>, ModbusError> {
        for byte in self.crc.trailer() {
            self.sink.send(byte)?;
            self.written.push(byte);
        }
        self.sink.flush()?;
        Ok(self.written)
    }
}
