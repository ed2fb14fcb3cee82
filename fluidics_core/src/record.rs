//! Persistent configuration record stored at the start of a board's EEPROM.
//!
//! Layout (little-endian, packed, 42 bytes):
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 2    | version_major    |
//! | 2      | 2    | version_minor    |
//! | 4      | 2    | version_patch    |
//! | 6      | 1    | i2c_address      |
//! | 7      | 1    | programming_mode |
//! | 8      | 16   | uuid             |
//! | 24     | 9    | pin_modes        |
//! | 33     | 9    | pin_states       |
//!
//! Bit `p % 8` of byte `p / 8` in `pin_modes`/`pin_states` belongs to pin `p`.
use crate::error::CommandError;

pub const CONFIG_RECORD_SIZE: usize = 42;
/// Pins addressable through the bitmaps.
pub const BITMAP_PINS: u8 = 72;

const ADDRESS_OFFSET: usize = 6;
const MODE_OFFSET: usize = 7;
const UUID_OFFSET: usize = 8;
const PIN_MODES_OFFSET: usize = 24;
const PIN_STATES_OFFSET: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigRecord {
    pub version_major: i16,
    pub version_minor: i16,
    pub version_patch: i16,
    pub i2c_address: u8,
    pub programming_mode: u8,
    pub uuid: [u8; 16],
    pub pin_modes: [u8; 9],
    pub pin_states: [u8; 9],
}

fn i16_at(bytes: &[u8; CONFIG_RECORD_SIZE], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn set_bit(map: &mut [u8; 9], pin: u8, on: bool) {
    let (byte, bit) = (usize::from(pin / 8), pin % 8);
    if let Some(b) = map.get_mut(byte) {
        if on {
            *b |= 1 << bit;
        } else {
            *b &= !(1 << bit);
        }
    }
}

fn bit(map: &[u8; 9], pin: u8) -> bool {
    map.get(usize::from(pin / 8))
        .is_some_and(|b| b & (1 << (pin % 8)) != 0)
}

impl ConfigRecord {
    pub fn encode(&self) -> [u8; CONFIG_RECORD_SIZE] {
        let mut out = [0u8; CONFIG_RECORD_SIZE];
        out[0..2].copy_from_slice(&self.version_major.to_le_bytes());
        out[2..4].copy_from_slice(&self.version_minor.to_le_bytes());
        out[4..6].copy_from_slice(&self.version_patch.to_le_bytes());
        out[ADDRESS_OFFSET] = self.i2c_address;
        out[MODE_OFFSET] = self.programming_mode;
        out[UUID_OFFSET..PIN_MODES_OFFSET].copy_from_slice(&self.uuid);
        out[PIN_MODES_OFFSET..PIN_STATES_OFFSET].copy_from_slice(&self.pin_modes);
        out[PIN_STATES_OFFSET..].copy_from_slice(&self.pin_states);
        out
    }

    pub fn from_bytes(bytes: &[u8; CONFIG_RECORD_SIZE]) -> Self {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[UUID_OFFSET..PIN_MODES_OFFSET]);
        let mut pin_modes = [0u8; 9];
        pin_modes.copy_from_slice(&bytes[PIN_MODES_OFFSET..PIN_STATES_OFFSET]);
        let mut pin_states = [0u8; 9];
        pin_states.copy_from_slice(&bytes[PIN_STATES_OFFSET..]);
        Self {
            version_major: i16_at(bytes, 0),
            version_minor: i16_at(bytes, 2),
            version_patch: i16_at(bytes, 4),
            i2c_address: bytes[ADDRESS_OFFSET],
            programming_mode: bytes[MODE_OFFSET],
            uuid,
            pin_modes,
            pin_states,
        }
    }

    /// Decode a record of exactly `CONFIG_RECORD_SIZE` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let arr: &[u8; CONFIG_RECORD_SIZE] = bytes.try_into().map_err(|_| {
            CommandError::Decode(format!(
                "config record is {} bytes, expected {CONFIG_RECORD_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }

    /// `true` when `pin` is configured as an output.
    pub fn is_output(&self, pin: u8) -> bool {
        bit(&self.pin_modes, pin)
    }

    pub fn set_output(&mut self, pin: u8, output: bool) {
        set_bit(&mut self.pin_modes, pin, output);
    }

    /// Power-on level of `pin`.
    pub fn initial_level(&self, pin: u8) -> bool {
        bit(&self.pin_states, pin)
    }

    pub fn set_initial_level(&mut self, pin: u8, high: bool) {
        set_bit(&mut self.pin_states, pin, high);
    }

    /// `major.minor.patch`
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version_major, self.version_minor, self.version_patch
        )
    }

    /// Lowercase hex, no separators.
    pub fn uuid_hex(&self) -> String {
        self.uuid.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn field_offsets_match_layout() {
        let rec = ConfigRecord {
            version_major: 0x0102,
            version_patch: -1,
            i2c_address: 17,
            programming_mode: 1,
            uuid: [0xAA; 16],
            pin_modes: [0x11; 9],
            pin_states: [0x22; 9],
            ..ConfigRecord::default()
        };
        let b = rec.encode();
        assert_eq!(&b[0..2], &[0x02, 0x01]);
        assert_eq!(&b[4..6], &[0xFF, 0xFF]);
        assert_eq!(b[6], 17);
        assert_eq!(b[7], 1);
        assert_eq!(b[8], 0xAA);
        assert_eq!(b[23], 0xAA);
        assert_eq!(b[24], 0x11);
        assert_eq!(b[33], 0x22);
        assert_eq!(b[41], 0x22);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(matches!(
            ConfigRecord::decode(&[0u8; 41]),
            Err(CommandError::Decode(_))
        ));
    }

    #[test]
    fn pin_bits_follow_byte_and_bit_index() {
        let mut rec = ConfigRecord::default();
        rec.set_output(9, true);
        rec.set_initial_level(4, true);
        assert_eq!(rec.pin_modes[1], 0b10);
        assert_eq!(rec.pin_states[0], 0b1_0000);
        assert!(rec.is_output(9) && !rec.is_output(8));
        rec.set_output(9, false);
        assert_eq!(rec.pin_modes[1], 0);
        // Pins past the bitmap are ignored.
        rec.set_output(BITMAP_PINS, true);
        assert!(!rec.is_output(BITMAP_PINS));
    }

    proptest! {
        #[test]
        fn encode_decode_is_identity(bytes in proptest::collection::vec(any::<u8>(), CONFIG_RECORD_SIZE)) {
            let rec = ConfigRecord::decode(&bytes).unwrap();
            prop_assert_eq!(rec.encode().to_vec(), bytes);
        }
    }
}
