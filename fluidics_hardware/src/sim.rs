//! In-memory emulation of the base-node motor boards and local switches.
//!
//! `SimulatedBus` answers the command/response protocol the way the board
//! firmware does: every write replaces the pending reply, a 2-byte read
//! returns the reply header and the following read returns the payload with
//! its trailer byte. Digital writes are recorded as `PinEvent`s so tests and
//! the CLI simulation can inspect what the rig would have done.
//!
//! Clones share state; the bus can be handed to the controller while a test
//! keeps a handle for inspection.
use crate::error::HwError;
use fluidics_traits::{I2cBus, SwitchBank};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

// Firmware-side command table.
const GET_PROTOCOL_NAME: u8 = 0x80;
const GET_PROTOCOL_VERSION: u8 = 0x81;
const GET_DEVICE_NAME: u8 = 0x82;
const GET_MANUFACTURER: u8 = 0x83;
const GET_HARDWARE_VERSION: u8 = 0x84;
const GET_SOFTWARE_VERSION: u8 = 0x85;
const GET_URL: u8 = 0x86;
const PERSISTENT_READ: u8 = 0x90;
const PERSISTENT_WRITE: u8 = 0x91;
const LOAD_CONFIG: u8 = 0x92;
const SET_PIN_MODE: u8 = 0x93;
const DIGITAL_READ: u8 = 0x94;
const DIGITAL_WRITE: u8 = 0x95;
const ANALOG_READ: u8 = 0x96;
const ANALOG_WRITE: u8 = 0x97;

const RETURN_OK: u8 = 0x00;
const RETURN_UNKNOWN_COMMAND: u8 = 0x02;
const RETURN_BAD_INDEX: u8 = 0x05;
const RETURN_BAD_PACKET_SIZE: u8 = 0x06;

/// Number of addressable pins (9 bitmap bytes).
pub const PIN_COUNT: usize = 72;
/// Size of the emulated EEPROM.
pub const EEPROM_SIZE: usize = 512;

// Config record offsets (see `ConfigRecord` in fluidics_core).
const CFG_ADDRESS: usize = 6;
const CFG_UUID: usize = 8;
const CFG_PIN_MODES: usize = 24;
const CFG_PIN_STATES: usize = 33;
const CFG_LEN: usize = 42;

/// One observed digital write on a simulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub address: u8,
    pub pin: u8,
    pub high: bool,
    pub at: Instant,
}

/// Firmware state of one emulated board.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pub device_name: String,
    pub eeprom: Vec<u8>,
    pub pin_modes: [bool; PIN_COUNT],
    pub levels: [bool; PIN_COUNT],
    pub analog: [i16; PIN_COUNT],
    /// Incremented on every load-config command.
    pub loads: u32,
    pending: Vec<u8>,
    forced_code: Option<u8>,
}

impl SimulatedBoard {
    /// A Grove I2C motor board with factory EEPROM contents for `address`.
    pub fn motor_board(address: u8) -> Self {
        let mut eeprom = vec![0xFF; EEPROM_SIZE];
        eeprom[..CFG_LEN].fill(0);
        // version 0.1.0
        eeprom[2] = 1;
        eeprom[CFG_ADDRESS] = address;
        for (i, b) in eeprom[CFG_UUID..CFG_UUID + 16].iter_mut().enumerate() {
            *b = address.wrapping_add(i as u8);
        }
        Self {
            device_name: "grove-i2c-motor".to_string(),
            eeprom,
            pin_modes: [false; PIN_COUNT],
            levels: [false; PIN_COUNT],
            analog: [0; PIN_COUNT],
            loads: 0,
            pending: Vec::new(),
            forced_code: None,
        }
    }

    fn configured_address(&self) -> u8 {
        self.eeprom[CFG_ADDRESS]
    }

    fn reply(&mut self, code: u8, payload: &[u8]) {
        let code = self.forced_code.take().unwrap_or(code);
        self.pending.clear();
        if code != RETURN_OK {
            self.pending.extend_from_slice(&[0, code]);
            return;
        }
        let trailer = payload.iter().fold(0u8, |acc, b| acc ^ b);
        self.pending.push((payload.len() + 1) as u8);
        self.pending.push(code);
        self.pending.extend_from_slice(payload);
        self.pending.push(trailer);
    }

    fn apply_stored_config(&mut self) {
        for pin in 0..PIN_COUNT {
            let (byte, bit) = (pin / 8, pin % 8);
            self.pin_modes[pin] = self.eeprom[CFG_PIN_MODES + byte] & (1 << bit) != 0;
            self.levels[pin] = self.eeprom[CFG_PIN_STATES + byte] & (1 << bit) != 0;
        }
    }

    /// Execute one command frame; returns the new bus address if load-config moved it.
    fn handle(&mut self, frame: &[u8]) -> Option<u8> {
        let Some((&opcode, args)) = frame.split_first() else {
            self.reply(RETURN_BAD_PACKET_SIZE, &[]);
            return None;
        };
        let pin_ok = |p: u8| (p as usize) < PIN_COUNT;
        match opcode {
            GET_PROTOCOL_NAME => self.reply(RETURN_OK, b"base_node"),
            GET_PROTOCOL_VERSION => self.reply(RETURN_OK, b"0.1"),
            GET_DEVICE_NAME => {
                let name = self.device_name.clone();
                self.reply(RETURN_OK, name.as_bytes());
            }
            GET_MANUFACTURER => self.reply(RETURN_OK, b"Seeed"),
            GET_HARDWARE_VERSION => self.reply(RETURN_OK, b"1.0"),
            GET_SOFTWARE_VERSION => self.reply(RETURN_OK, b"0.1.0"),
            GET_URL => self.reply(RETURN_OK, b"https://github.com/wheeler-microfluidics"),
            PERSISTENT_READ => match args {
                [lo, hi] => {
                    let addr = i16::from_le_bytes([*lo, *hi]);
                    match usize::try_from(addr).ok().filter(|a| *a < EEPROM_SIZE) {
                        Some(a) => {
                            let v = self.eeprom[a];
                            self.reply(RETURN_OK, &[v]);
                        }
                        None => self.reply(RETURN_BAD_INDEX, &[]),
                    }
                }
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            PERSISTENT_WRITE => match args {
                [lo, hi, value] => {
                    let addr = i16::from_le_bytes([*lo, *hi]);
                    match usize::try_from(addr).ok().filter(|a| *a < EEPROM_SIZE) {
                        Some(a) => {
                            self.eeprom[a] = *value;
                            self.reply(RETURN_OK, &[]);
                        }
                        None => self.reply(RETURN_BAD_INDEX, &[]),
                    }
                }
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            LOAD_CONFIG => match args {
                [use_defaults] => {
                    let before = self.configured_address();
                    if *use_defaults != 0 {
                        let fresh = Self::motor_board(before);
                        self.eeprom = fresh.eeprom;
                    }
                    self.apply_stored_config();
                    self.loads += 1;
                    self.reply(RETURN_OK, &[]);
                    return Some(self.configured_address());
                }
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            SET_PIN_MODE => match args {
                [pin, mode] if pin_ok(*pin) => {
                    self.pin_modes[*pin as usize] = *mode != 0;
                    self.reply(RETURN_OK, &[]);
                }
                [_, _] => self.reply(RETURN_BAD_INDEX, &[]),
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            DIGITAL_READ => match args {
                [pin] if pin_ok(*pin) => {
                    let v = u8::from(self.levels[*pin as usize]);
                    self.reply(RETURN_OK, &[v]);
                }
                [_] => self.reply(RETURN_BAD_INDEX, &[]),
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            DIGITAL_WRITE => match args {
                [pin, value] if pin_ok(*pin) => {
                    self.levels[*pin as usize] = *value != 0;
                    self.reply(RETURN_OK, &[]);
                }
                [_, _] => self.reply(RETURN_BAD_INDEX, &[]),
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            ANALOG_READ => match args {
                [pin] if pin_ok(*pin) => {
                    let v = self.analog[*pin as usize].to_le_bytes();
                    self.reply(RETURN_OK, &v);
                }
                [_] => self.reply(RETURN_BAD_INDEX, &[]),
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            ANALOG_WRITE => match args {
                [pin, value] if pin_ok(*pin) => {
                    self.analog[*pin as usize] = i16::from(*value);
                    self.reply(RETURN_OK, &[]);
                }
                [_, _] => self.reply(RETURN_BAD_INDEX, &[]),
                _ => self.reply(RETURN_BAD_PACKET_SIZE, &[]),
            },
            _ => self.reply(RETURN_UNKNOWN_COMMAND, &[]),
        }
        None
    }
}

#[derive(Debug, Default)]
struct BusState {
    boards: HashMap<u8, SimulatedBoard>,
    writes: Vec<(u8, Vec<u8>)>,
    pin_events: Vec<PinEvent>,
    // Bytes of the pending reply already handed out, per address.
    cursor: HashMap<u8, usize>,
}

/// Shared in-memory bus hosting any number of `SimulatedBoard`s.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with a factory-fresh motor board at each address.
    pub fn with_motor_boards(addresses: impl IntoIterator<Item = u8>) -> Self {
        let bus = Self::new();
        for a in addresses {
            bus.attach(a, SimulatedBoard::motor_board(a));
        }
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking test thread must not wedge every other user of the bus.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn attach(&self, address: u8, board: SimulatedBoard) {
        self.lock().boards.insert(address, board);
    }

    /// Force the next reply of the board at `address` to carry `code`.
    pub fn fail_next(&self, address: u8, code: u8) {
        if let Some(b) = self.lock().boards.get_mut(&address) {
            b.forced_code = Some(code);
        }
    }

    /// Inspect a board's state.
    pub fn board(&self, address: u8) -> Option<SimulatedBoard> {
        self.lock().boards.get(&address).cloned()
    }

    pub fn level(&self, address: u8, pin: u8) -> Option<bool> {
        self.lock()
            .boards
            .get(&address)
            .and_then(|b| b.levels.get(pin as usize).copied())
    }

    pub fn set_analog(&self, address: u8, pin: u8, value: i16) {
        if let Some(b) = self.lock().boards.get_mut(&address) {
            if let Some(slot) = b.analog.get_mut(pin as usize) {
                *slot = value;
            }
        }
    }

    /// Every raw frame written, in bus order.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Digital writes observed on `(address, pin)`, in bus order.
    pub fn pin_events(&self, address: u8, pin: u8) -> Vec<PinEvent> {
        self.lock()
            .pin_events
            .iter()
            .filter(|e| e.address == address && e.pin == pin)
            .copied()
            .collect()
    }

    pub fn all_pin_events(&self) -> Vec<PinEvent> {
        self.lock().pin_events.clone()
    }

    pub fn clear_log(&self) {
        let mut st = self.lock();
        st.writes.clear();
        st.pin_events.clear();
    }
}

impl I2cBus for SimulatedBus {
    fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.lock();
        let Some(board) = st.boards.get_mut(&address) else {
            return Err(Box::new(HwError::Nack { address }));
        };
        let moved = board.handle(bytes);
        st.cursor.insert(address, 0);
        st.writes.push((address, bytes.to_vec()));
        if let [DIGITAL_WRITE, pin, value] = bytes {
            st.pin_events.push(PinEvent {
                address,
                pin: *pin,
                high: *value != 0,
                at: Instant::now(),
            });
        }
        if let Some(new_addr) = moved.filter(|a| *a != address) {
            if let Some(b) = st.boards.remove(&address) {
                tracing::debug!(from = address, to = new_addr, "simulated board readdressed");
                st.boards.insert(new_addr, b);
            }
        }
        Ok(())
    }

    fn read(
        &mut self,
        address: u8,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.lock();
        let start = st.cursor.get(&address).copied().unwrap_or(0);
        let Some(board) = st.boards.get(&address) else {
            return Err(Box::new(HwError::Nack { address }));
        };
        let available = board.pending.len().saturating_sub(start);
        if available < buf.len() {
            return Err(Box::new(HwError::ShortTransfer {
                expected: buf.len(),
                actual: available,
            }));
        }
        buf.copy_from_slice(&board.pending[start..start + buf.len()]);
        st.cursor.insert(address, start + buf.len());
        Ok(())
    }
}

/// Local switch outputs kept in memory.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSwitches {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimulatedSwitches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels
            .lock()
            .ok()
            .and_then(|m| m.get(&pin).copied())
    }
}

impl SwitchBank for SimulatedSwitches {
    fn set_level(
        &mut self,
        pin: u8,
        high: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut m = self
            .levels
            .lock()
            .map_err(|_| HwError::Gpio("switch state poisoned".into()))?;
        m.insert(pin, high);
        tracing::debug!(pin, high, "switch set (simulated)");
        Ok(())
    }
}
