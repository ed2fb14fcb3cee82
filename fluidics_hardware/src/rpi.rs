//! Raspberry Pi backends: `/dev/i2c-N` through rppal and local GPIO switches.
use crate::error::HwError;
use fluidics_traits::{I2cBus, SwitchBank};
use rppal::gpio::{Gpio, OutputPin};
use rppal::i2c::I2c;
use std::collections::HashMap;

pub struct RppalBus {
    i2c: I2c,
    selected: Option<u8>,
}

impl RppalBus {
    pub fn open(bus: u8) -> Result<Self, HwError> {
        let i2c = I2c::with_bus(bus).map_err(|e| HwError::I2c(format!("open i2c-{bus}: {e}")))?;
        tracing::debug!(bus, "i2c bus opened");
        Ok(Self {
            i2c,
            selected: None,
        })
    }

    fn select(&mut self, address: u8) -> Result<(), HwError> {
        if self.selected != Some(address) {
            self.i2c
                .set_slave_address(u16::from(address))
                .map_err(|e| HwError::I2c(format!("select {address:#04x}: {e}")))?;
            self.selected = Some(address);
        }
        Ok(())
    }
}

impl I2cBus for RppalBus {
    fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.select(address)?;
        let n = self
            .i2c
            .write(bytes)
            .map_err(|e| HwError::I2c(format!("write {address:#04x}: {e}")))?;
        if n != bytes.len() {
            return Err(Box::new(HwError::ShortTransfer {
                expected: bytes.len(),
                actual: n,
            }));
        }
        Ok(())
    }

    fn read(
        &mut self,
        address: u8,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.select(address)?;
        let n = self
            .i2c
            .read(buf)
            .map_err(|e| HwError::I2c(format!("read {address:#04x}: {e}")))?;
        if n != buf.len() {
            return Err(Box::new(HwError::ShortTransfer {
                expected: buf.len(),
                actual: n,
            }));
        }
        Ok(())
    }
}

/// GPIO outputs claimed lazily on first use.
pub struct RppalSwitches {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
}

impl RppalSwitches {
    pub fn new() -> Result<Self, HwError> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(format!("open gpio: {e}")))?;
        Ok(Self {
            gpio,
            pins: HashMap::new(),
        })
    }
}

impl SwitchBank for RppalSwitches {
    fn set_level(
        &mut self,
        pin: u8,
        high: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.pins.contains_key(&pin) {
            let out = self
                .gpio
                .get(pin)
                .map_err(|e| HwError::Gpio(format!("claim pin {pin}: {e}")))?
                .into_output_low();
            self.pins.insert(pin, out);
        }
        if let Some(out) = self.pins.get_mut(&pin) {
            if high {
                out.set_high();
            } else {
                out.set_low();
            }
        }
        Ok(())
    }
}
