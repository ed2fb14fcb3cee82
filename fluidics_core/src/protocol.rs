//! Command/response exchange with `base_node` peripherals.
//!
//! A command is one write of `[opcode, args...]`. When a reply is expected the
//! controller waits a short settle delay, reads a two byte header
//! `[payload_len, return_code]` and, on success, reads `payload_len` bytes of
//! which the last one is a trailer and is discarded.
//!
//! The bus is shared by every actuator. `SharedBus` serializes whole
//! exchanges, so a reply is never interleaved with another command.
use crate::error::CommandError;
use crate::hw_error::map_bus_error;
use crate::record::{CONFIG_RECORD_SIZE, ConfigRecord};
use fluidics_traits::I2cBus;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Delay between a command write and the header read.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1);

/// Return code signalling success.
pub const RETURN_OK: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    GetProtocolName = 0x80,
    GetProtocolVersion = 0x81,
    GetDeviceName = 0x82,
    GetManufacturer = 0x83,
    GetHardwareVersion = 0x84,
    GetSoftwareVersion = 0x85,
    GetUrl = 0x86,
    PersistentRead = 0x90,
    PersistentWrite = 0x91,
    LoadConfig = 0x92,
    SetPinMode = 0x93,
    DigitalRead = 0x94,
    DigitalWrite = 0x95,
    AnalogRead = 0x96,
    AnalogWrite = 0x97,
}

impl Opcode {
    #[inline]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetProtocolName => "GET_PROTOCOL_NAME",
            Self::GetProtocolVersion => "GET_PROTOCOL_VERSION",
            Self::GetDeviceName => "GET_DEVICE_NAME",
            Self::GetManufacturer => "GET_MANUFACTURER",
            Self::GetHardwareVersion => "GET_HARDWARE_VERSION",
            Self::GetSoftwareVersion => "GET_SOFTWARE_VERSION",
            Self::GetUrl => "GET_URL",
            Self::PersistentRead => "PERSISTENT_READ",
            Self::PersistentWrite => "PERSISTENT_WRITE",
            Self::LoadConfig => "LOAD_CONFIG",
            Self::SetPinMode => "SET_PIN_MODE",
            Self::DigitalRead => "DIGITAL_READ",
            Self::DigitalWrite => "DIGITAL_WRITE",
            Self::AnalogRead => "ANALOG_READ",
            Self::AnalogWrite => "ANALOG_WRITE",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-OK return code reported by a peripheral.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolError {
    #[error("RETURN_GENERAL_ERROR")]
    GeneralError,
    #[error("RETURN_UNKNOWN_COMMAND")]
    UnknownCommand,
    #[error("RETURN_TIMEOUT")]
    Timeout,
    #[error("RETURN_NOT_CONNECTED")]
    NotConnected,
    #[error("RETURN_BAD_INDEX")]
    BadIndex,
    #[error("RETURN_BAD_PACKET_SIZE")]
    BadPacketSize,
    #[error("RETURN_BAD_CRC")]
    BadCrc,
    #[error("RETURN_BAD_VALUE")]
    BadValue,
    #[error("RETURN_MAX_PAYLOAD_EXCEEDED")]
    MaxPayloadExceeded,
    /// Any code outside the reserved range; the raw byte is kept for logs.
    #[error("RETURN_UNKNOWN_ERROR")]
    UnknownError(u8),
}

impl ProtocolError {
    /// Classify a return code byte. `RETURN_OK` maps to `Ok(())`.
    pub const fn check(code: u8) -> Result<(), Self> {
        Err(match code {
            RETURN_OK => return Ok(()),
            0x01 => Self::GeneralError,
            0x02 => Self::UnknownCommand,
            0x03 => Self::Timeout,
            0x04 => Self::NotConnected,
            0x05 => Self::BadIndex,
            0x06 => Self::BadPacketSize,
            0x07 => Self::BadCrc,
            0x08 => Self::BadValue,
            0x09 => Self::MaxPayloadExceeded,
            other => Self::UnknownError(other),
        })
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::GeneralError => 0x01,
            Self::UnknownCommand => 0x02,
            Self::Timeout => 0x03,
            Self::NotConnected => 0x04,
            Self::BadIndex => 0x05,
            Self::BadPacketSize => 0x06,
            Self::BadCrc => 0x07,
            Self::BadValue => 0x08,
            Self::MaxPayloadExceeded => 0x09,
            Self::UnknownError(c) => c,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GeneralError => "RETURN_GENERAL_ERROR",
            Self::UnknownCommand => "RETURN_UNKNOWN_COMMAND",
            Self::Timeout => "RETURN_TIMEOUT",
            Self::NotConnected => "RETURN_NOT_CONNECTED",
            Self::BadIndex => "RETURN_BAD_INDEX",
            Self::BadPacketSize => "RETURN_BAD_PACKET_SIZE",
            Self::BadCrc => "RETURN_BAD_CRC",
            Self::BadValue => "RETURN_BAD_VALUE",
            Self::MaxPayloadExceeded => "RETURN_MAX_PAYLOAD_EXCEEDED",
            Self::UnknownError(_) => "RETURN_UNKNOWN_ERROR",
        }
    }
}

/// Build the wire frame for `opcode` with `args`.
pub fn encode_frame(opcode: Opcode, args: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(args.len() + 1);
    frame.push(opcode.byte());
    frame.extend_from_slice(args);
    frame
}

/// Strip the trailing byte of a reply payload.
pub fn strip_trailer(mut payload: Vec<u8>) -> Vec<u8> {
    payload.pop();
    payload
}

/// I2C bus shared by every channel and actuator.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<Box<dyn I2cBus + Send>>>,
}

impl fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBus").finish_non_exhaustive()
    }
}

impl SharedBus {
    pub fn new<B: I2cBus + Send + 'static>(bus: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(bus))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn I2cBus + Send>>, CommandError> {
        self.inner
            .lock()
            .map_err(|_| CommandError::Bus("bus lock poisoned".into()))
    }

    /// Channel to the peripheral at `address`.
    pub fn channel(&self, address: u8) -> CommandChannel {
        CommandChannel::new(self.clone(), address)
    }
}

/// Command channel bound to one peripheral address.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    bus: SharedBus,
    address: u8,
    settle: Duration,
}

impl CommandChannel {
    pub fn new(bus: SharedBus, address: u8) -> Self {
        Self {
            bus,
            address,
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Send a command and read back its reply payload (trailer removed).
    pub fn execute(&self, opcode: Opcode, args: &[u8]) -> Result<Vec<u8>, CommandError> {
        let frame = encode_frame(opcode, args);
        let mut bus = self.bus.lock()?;
        bus.write(self.address, &frame)
            .map_err(|e| map_bus_error(e.as_ref()))?;
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }

        let mut header = [0u8; 2];
        bus.read(self.address, &mut header)
            .map_err(|e| map_bus_error(e.as_ref()))?;
        let [len, code] = header;
        if let Err(source) = ProtocolError::check(code) {
            tracing::warn!(
                address = self.address,
                opcode = opcode.name(),
                code = source.name(),
                raw = source.code(),
                "command rejected"
            );
            return Err(CommandError::Protocol {
                address: self.address,
                opcode,
                source,
            });
        }

        let mut payload = vec![0u8; usize::from(len)];
        if !payload.is_empty() {
            bus.read(self.address, &mut payload)
                .map_err(|e| map_bus_error(e.as_ref()))?;
        }
        tracing::trace!(address = self.address, opcode = opcode.name(), len, "reply");
        Ok(strip_trailer(payload))
    }

    /// Send a command without waiting for a reply.
    pub fn execute_fire_and_forget(&self, opcode: Opcode, args: &[u8]) -> Result<(), CommandError> {
        let frame = encode_frame(opcode, args);
        let mut bus = self.bus.lock()?;
        bus.write(self.address, &frame)
            .map_err(|e| map_bus_error(e.as_ref()))?;
        tracing::trace!(address = self.address, opcode = opcode.name(), "sent");
        Ok(())
    }

    fn string(&self, opcode: Opcode) -> Result<String, CommandError> {
        let payload = self.execute(opcode, &[])?;
        String::from_utf8(payload)
            .map_err(|e| CommandError::Decode(format!("{opcode} reply is not utf-8: {e}")))
    }

    pub fn protocol_name(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetProtocolName)
    }

    pub fn protocol_version(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetProtocolVersion)
    }

    pub fn device_name(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetDeviceName)
    }

    pub fn manufacturer(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetManufacturer)
    }

    pub fn hardware_version(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetHardwareVersion)
    }

    pub fn software_version(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetSoftwareVersion)
    }

    pub fn url(&self) -> Result<String, CommandError> {
        self.string(Opcode::GetUrl)
    }

    pub fn digital_read(&self, pin: u8) -> Result<bool, CommandError> {
        let payload = self.execute(Opcode::DigitalRead, &[pin])?;
        payload
            .first()
            .map(|b| *b != 0)
            .ok_or_else(|| CommandError::Decode("DIGITAL_READ reply is empty".into()))
    }

    pub fn digital_write(&self, pin: u8, high: bool) -> Result<(), CommandError> {
        self.execute_fire_and_forget(Opcode::DigitalWrite, &[pin, u8::from(high)])
    }

    /// Signed 16-bit little-endian sample.
    pub fn analog_read(&self, pin: u8) -> Result<i16, CommandError> {
        let payload = self.execute(Opcode::AnalogRead, &[pin])?;
        match payload.as_slice() {
            [lo, hi] => Ok(i16::from_le_bytes([*lo, *hi])),
            other => Err(CommandError::Decode(format!(
                "ANALOG_READ reply has {} bytes, expected 2",
                other.len()
            ))),
        }
    }

    pub fn analog_write(&self, pin: u8, value: u8) -> Result<(), CommandError> {
        self.execute_fire_and_forget(Opcode::AnalogWrite, &[pin, value])
    }

    pub fn pin_mode(&self, pin: u8, mode: u8) -> Result<(), CommandError> {
        self.execute_fire_and_forget(Opcode::SetPinMode, &[pin, mode])
    }

    pub fn persistent_read(&self, offset: i16) -> Result<u8, CommandError> {
        let [lo, hi] = offset.to_le_bytes();
        let payload = self.execute(Opcode::PersistentRead, &[lo, hi])?;
        payload
            .first()
            .copied()
            .ok_or_else(|| CommandError::Decode(format!("PERSISTENT_READ {offset} reply is empty")))
    }

    pub fn persistent_write(&self, offset: i16, value: u8) -> Result<(), CommandError> {
        let [lo, hi] = offset.to_le_bytes();
        self.execute_fire_and_forget(Opcode::PersistentWrite, &[lo, hi, value])
    }

    /// Ask the peripheral to re-apply its stored configuration (or factory
    /// defaults). No reply is read; the board may come back on a new address.
    pub fn load_config(&self, use_defaults: bool) -> Result<(), CommandError> {
        self.execute_fire_and_forget(Opcode::LoadConfig, &[u8::from(use_defaults)])
    }

    /// Read the configuration record byte by byte from persistent storage.
    pub fn read_config(&self) -> Result<ConfigRecord, CommandError> {
        let mut bytes = [0u8; CONFIG_RECORD_SIZE];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.persistent_read(i as i16)?;
        }
        Ok(ConfigRecord::from_bytes(&bytes))
    }

    /// Write the configuration record byte by byte. Does not load it.
    pub fn write_config(&self, record: &ConfigRecord) -> Result<(), CommandError> {
        for (i, b) in record.encode().iter().enumerate() {
            self.persistent_write(i as i16, *b)?;
        }
        tracing::debug!(address = self.address, "config record written");
        Ok(())
    }
}
