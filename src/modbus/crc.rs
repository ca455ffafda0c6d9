pub const CRC16_INIT: u16 = 0xFFFF;
pub const CRC16_POLY: u16 = 0xA001;

/// Folds one byte into a CRC16/MODBUS state.
pub fn crc16_step(state: u16, byte: u8) -> u16 {
    let mut crc = state ^ byte as u16;

    for _ in 0..8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ CRC16_POLY;
        } else {
            crc >>= 1;
        }
    }
    crc
}

pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.value()
}

/// Incremental CRC16/MODBUS accumulator.
///
/// A fresh accumulator is used for every inbound or outbound byte sequence;
/// nothing is carried over between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16 {
    state: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Self { state: CRC16_INIT }
    }

    pub fn push(&mut self, byte: u8) {
        self.state = crc16_step(self.state, byte);
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.push(byte);
        }
    }

    pub fn value(&self) -> u16 {
        self.state
    }

    /// Wire order of the checksum: low byte first.
    pub fn trailer(&self) -> [u8; 2] {
        [(self.state & 0xFF) as u8, (self.state >> 8) as u8]
    }

    pub fn matches(&self, crc_lo: u8, crc_hi: u8) -> bool {
        self.state == u16::from_le_bytes([crc_lo, crc_hi])
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}
