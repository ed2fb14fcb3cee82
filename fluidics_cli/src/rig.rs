//! Builds the bus, local switches and sequencer from a validated config.
//!
//! Without the `hardware` feature every board named in `address_map` is a
//! simulated motor board, so all commands can be exercised on a laptop.

use eyre::WrapErr;
use fluidics_config::Config;
use fluidics_core::{BusTiming, CommandChannel, PumpDefaults, Sequencer, SharedBus, StepBook};
use fluidics_traits::{MonotonicClock, SwitchBank};

pub struct Rig {
    pub bus: SharedBus,
    pub timing: BusTiming,
    switches: Box<dyn SwitchBank + Send>,
}

impl Rig {
    #[cfg(not(feature = "hardware"))]
    pub fn open(cfg: &Config) -> eyre::Result<Self> {
        let sim = fluidics_hardware::SimulatedBus::with_motor_boards(cfg.bus_addresses());
        tracing::debug!(boards = ?cfg.bus_addresses(), "using simulated bus");
        Ok(Self {
            bus: SharedBus::new(sim),
            timing: BusTiming::from(&cfg.bus),
            switches: Box::new(fluidics_hardware::SimulatedSwitches::new()),
        })
    }

    #[cfg(all(feature = "hardware", target_os = "linux"))]
    pub fn open(cfg: &Config) -> eyre::Result<Self> {
        let bus = fluidics_hardware::RppalBus::open(cfg.bus.i2c_bus)
            .wrap_err_with(|| format!("open i2c bus {}", cfg.bus.i2c_bus))?;
        let switches: Box<dyn SwitchBank + Send> = match fluidics_hardware::RppalSwitches::new() {
            Ok(s) => Box::new(s),
            Err(e) => {
                tracing::warn!(error = %e, "local GPIO unavailable; switch steps will be ignored");
                Box::new(fluidics_core::mocks::NoopSwitches)
            }
        };
        Ok(Self {
            bus: SharedBus::new(bus),
            timing: BusTiming::from(&cfg.bus),
            switches,
        })
    }

    #[cfg(all(feature = "hardware", not(target_os = "linux")))]
    pub fn open(_cfg: &Config) -> eyre::Result<Self> {
        eyre::bail!("the hardware backend is only available on Linux")
    }

    pub fn channel(&self, address: u8) -> CommandChannel {
        self.bus.channel(address).with_settle(self.timing.settle)
    }

    /// Consume the rig into a sequencer over the configured steps.
    pub fn into_sequencer(self, cfg: &Config) -> eyre::Result<Sequencer<MonotonicClock>> {
        let steps = StepBook::try_from(cfg).wrap_err("build step table")?;
        Ok(Sequencer::new(self.bus, steps, MonotonicClock::new())
            .with_timing(self.timing)
            .with_defaults(PumpDefaults::from(&cfg.defaults))
            .with_switches(self.switches))
    }
}
