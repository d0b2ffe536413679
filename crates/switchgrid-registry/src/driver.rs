//! Local pin hardware behind a trait, so processors are testable without
//! real GPIO.

use std::collections::HashMap;
use std::sync::Mutex;

use switchgrid_core::error::Result;
use switchgrid_core::model::PinValue;

/// Driver for pins wired to this node (client id 0).
pub trait PinDriver: Send + Sync {
    fn read(&self, pin: u32) -> Result<PinValue>;
    fn write(&self, pin: u32, value: PinValue) -> Result<()>;
}

/// In-memory driver. Unwritten pins read Low.
#[derive(Default)]
pub struct MemoryPinDriver {
    pins: Mutex<HashMap<u32, PinValue>>,
}

impl MemoryPinDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of a pin (test/inspection helper).
    pub fn get(&self, pin: u32) -> PinValue {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .copied()
            .unwrap_or(PinValue::Low)
    }
}

impl PinDriver for MemoryPinDriver {
    fn read(&self, pin: u32) -> Result<PinValue> {
        Ok(self.get(pin))
    }

    fn write(&self, pin: u32, value: PinValue) -> Result<()> {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_driver_defaults_low() {
        let driver = MemoryPinDriver::new();
        assert_eq!(driver.read(5).unwrap(), PinValue::Low);
        driver.write(5, PinValue::High).unwrap();
        assert_eq!(driver.read(5).unwrap(), PinValue::High);
        assert_eq!(driver.get(5), PinValue::High);
        driver.write(5, PinValue::Low).unwrap();
        assert_eq!(driver.read(5).unwrap(), PinValue::Low);
    }
}
