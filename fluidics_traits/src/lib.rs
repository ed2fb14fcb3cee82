pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Raw byte transport to addressed peripherals on a shared I2C bus.
///
/// Each call is one complete bus transaction. Framing, settle delays and
/// return-code handling live above this trait.
pub trait I2cBus {
    fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn read(
        &mut self,
        address: u8,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Local GPIO outputs driven directly by the controller (no bus framing).
pub trait SwitchBank {
    fn set_level(
        &mut self,
        pin: u8,
        high: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<B: I2cBus + ?Sized> I2cBus for Box<B> {
    fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).write(address, bytes)
    }
    fn read(
        &mut self,
        address: u8,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).read(address, buf)
    }
}

impl<S: SwitchBank + ?Sized> SwitchBank for Box<S> {
    fn set_level(
        &mut self,
        pin: u8,
        high: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_level(pin, high)
    }
}
