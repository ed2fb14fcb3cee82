//! Grove I2C motor board helpers: output pin map, first-time setup,
//! identify blink and identity readout.
use crate::error::CommandError;
use crate::protocol::CommandChannel;
use crate::record::ConfigRecord;
use fluidics_traits::Clock;
use std::time::Duration;

/// IN1..IN4, addressed by output index 0..3.
pub const OUTPUT_PINS: [u8; 4] = [4, 5, 6, 7];
/// ENA, ENB
pub const ENABLE_PINS: [u8; 2] = [9, 10];

/// Board pin for output `index`, `None` past IN4.
#[inline]
pub fn output_pin(index: u8) -> Option<u8> {
    OUTPUT_PINS.get(usize::from(index)).copied()
}

/// Identity strings plus the stored configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub address: u8,
    pub protocol_name: String,
    pub protocol_version: String,
    pub device_name: String,
    pub manufacturer: String,
    pub hardware_version: String,
    pub software_version: String,
    pub url: String,
    pub config: ConfigRecord,
}

pub fn read_info(ch: &CommandChannel) -> Result<BoardInfo, CommandError> {
    Ok(BoardInfo {
        address: ch.address(),
        protocol_name: ch.protocol_name()?,
        protocol_version: ch.protocol_version()?,
        device_name: ch.device_name()?,
        manufacturer: ch.manufacturer()?,
        hardware_version: ch.hardware_version()?,
        software_version: ch.software_version()?,
        url: ch.url()?,
        config: ch.read_config()?,
    })
}

/// Record with every IN pin an output defaulting low and both enables
/// outputs defaulting high.
pub fn motor_defaults(mut record: ConfigRecord) -> ConfigRecord {
    for pin in OUTPUT_PINS {
        record.set_output(pin, true);
        record.set_initial_level(pin, false);
    }
    for pin in ENABLE_PINS {
        record.set_output(pin, true);
        record.set_initial_level(pin, true);
    }
    record
}

/// Persist `record`, give the EEPROM `write_settle` to commit, then ask the
/// board to reload it.
pub fn apply_config<C: Clock>(
    ch: &CommandChannel,
    record: &ConfigRecord,
    clock: &C,
    write_settle: Duration,
) -> Result<(), CommandError> {
    ch.write_config(record)?;
    clock.sleep(write_settle);
    ch.load_config(false)
}

/// Configure a factory-fresh board for pump/valve duty, optionally moving it
/// to `new_address`. Returns the record that was written.
pub fn initialize<C: Clock>(
    ch: &CommandChannel,
    new_address: Option<u8>,
    clock: &C,
    write_settle: Duration,
) -> Result<ConfigRecord, CommandError> {
    let mut record = motor_defaults(ch.read_config()?);
    if let Some(addr) = new_address {
        record.i2c_address = addr;
    }
    apply_config(ch, &record, clock, write_settle)?;
    tracing::info!(
        address = ch.address(),
        configured = record.i2c_address,
        "motor board initialized"
    );
    Ok(record)
}

/// Walk the outputs so an operator can spot the board: enables off, each IN
/// low, then high, then low again, enables back on.
pub fn identify<C: Clock>(ch: &CommandChannel, clock: &C, hold: Duration) -> Result<(), CommandError> {
    for pin in ENABLE_PINS {
        ch.digital_write(pin, false)?;
    }
    for level in [false, true, false] {
        for pin in OUTPUT_PINS {
            ch.digital_write(pin, level)?;
            clock.sleep(hold);
        }
    }
    for pin in ENABLE_PINS {
        ch.digital_write(pin, true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SharedBus;
    use fluidics_hardware::SimulatedBus;
    use fluidics_traits::clock::test_clock::TestClock;

    fn channel(sim: &SimulatedBus, address: u8) -> CommandChannel {
        SharedBus::new(sim.clone())
            .channel(address)
            .with_settle(Duration::ZERO)
    }

    #[test]
    fn output_index_maps_to_in_pins() {
        assert_eq!(output_pin(0), Some(4));
        assert_eq!(output_pin(2), Some(6));
        assert_eq!(output_pin(3), Some(7));
        assert_eq!(output_pin(4), None);
    }

    #[test]
    fn initialize_sets_modes_and_levels() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let ch = channel(&sim, 17);
        let clock = TestClock::new();
        let rec = initialize(&ch, None, &clock, Duration::from_millis(10)).unwrap();
        assert!(OUTPUT_PINS.iter().all(|p| rec.is_output(*p) && !rec.initial_level(*p)));
        assert!(ENABLE_PINS.iter().all(|p| rec.is_output(*p) && rec.initial_level(*p)));
        assert_eq!(clock.elapsed(), Duration::from_millis(10));

        let board = sim.board(17).unwrap();
        assert_eq!(board.loads, 1);
        assert!(board.levels[9] && board.levels[10]);
        assert!(!board.levels[4]);
        assert_eq!(ch.read_config().unwrap(), rec);
    }

    #[test]
    fn initialize_can_readdress() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let clock = TestClock::new();
        initialize(&channel(&sim, 17), Some(21), &clock, Duration::ZERO).unwrap();
        assert!(sim.board(17).is_none());
        assert_eq!(channel(&sim, 21).read_config().unwrap().i2c_address, 21);
    }

    #[test]
    fn identify_pattern_ends_with_enables_high_and_ins_low() {
        let sim = SimulatedBus::with_motor_boards([17]);
        identify(&channel(&sim, 17), &TestClock::new(), Duration::from_millis(50)).unwrap();
        let events = sim.all_pin_events();
        // 2 enables off, 3 sweeps over 4 INs, 2 enables on
        assert_eq!(events.len(), 2 + 12 + 2);
        assert!(!events[0].high && events[0].pin == 9);
        assert!(events[6].high && events[6].pin == 4);
        for pin in OUTPUT_PINS {
            assert_eq!(sim.level(17, pin), Some(false));
        }
        for pin in ENABLE_PINS {
            assert_eq!(sim.level(17, pin), Some(true));
        }
    }

    #[test]
    fn info_reads_identity_and_record() {
        let sim = SimulatedBus::with_motor_boards([16]);
        let info = read_info(&channel(&sim, 16)).unwrap();
        assert_eq!(info.device_name, "grove-i2c-motor");
        assert_eq!(info.protocol_name, "base_node");
        assert_eq!(info.config.i2c_address, 16);
        assert_eq!(info.config.version(), "0.1.0");
    }
}
