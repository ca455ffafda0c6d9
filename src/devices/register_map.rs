use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::traits::RegisterBackend;

pub const REGISTER_SPACE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPreset {
    pub address: u8,
    pub value: u8,
}

/// In-memory register space standing in for the device's memory-mapped
/// peripherals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    cells: [u8; REGISTER_SPACE],
}

impl RegisterMap {
    pub fn new() -> Self {
        Self {
            cells: [0u8; REGISTER_SPACE],
        }
    }

    pub fn with_presets(presets: &[RegisterPreset]) -> Self {
        let mut map = Self::new();
        for preset in presets {
            debug!("Preset register 0x{:02X} = 0x{:02X}", preset.address, preset.value);
            map.cells[preset.address as usize] = preset.value;
        }
        map
    }

    pub fn get(&self, address: u8) -> u8 {
        self.cells[address as usize]
    }

    /// Non-zero registers keyed by hex address.
    pub fn to_json(&self) -> Value {
        let registers: serde_json::Map<String, Value> = self
            .cells
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value != 0)
            .map(|(address, &value)| (format!("0x{:02X}", address), json!(value)))
            .collect();

        json!({
            "size": REGISTER_SPACE,
            "registers": registers,
        })
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBackend for RegisterMap {
    fn read(&mut self, address: u8) -> u8 {
        self.cells[address as usize]
    }

    fn write(&mut self, address: u8, value: u8) {
        self.cells[address as usize] = value;
    }
}
