//! Conversions bridging `fluidics_config` types to `fluidics_core` types.
//!
//! Letters from `address_map` are resolved here, so the core never sees them.

use crate::board::output_pin;
use crate::config::{BusTiming, ProgramPlan, PumpDefaults};
use crate::error::FluidicsError;
use crate::step::{OutputAddr, RawSwitch, StepBook, StepDescriptor, ValveSetting};
use crate::valve::Branch;
use std::time::Duration;

// ── PumpDefaults ─────────────────────────────────────────────────────────────

impl From<&fluidics_config::Defaults> for PumpDefaults {
    fn from(c: &fluidics_config::Defaults) -> Self {
        Self {
            on_ms: c.on_ms,
            min_off_ms: c.min_off_ms,
            pulses: c.pulses_for_volume(c.volume_l),
            period_s: c.default_period_s(),
        }
    }
}

// ── BusTiming ────────────────────────────────────────────────────────────────

impl From<&fluidics_config::BusCfg> for BusTiming {
    fn from(c: &fluidics_config::BusCfg) -> Self {
        Self {
            settle: Duration::from_micros(c.settle_us),
            write_settle: Duration::from_millis(c.write_settle_ms),
        }
    }
}

// ── ProgramPlan ──────────────────────────────────────────────────────────────

impl From<&fluidics_config::ProgramCfg> for ProgramPlan {
    fn from(c: &fluidics_config::ProgramCfg) -> Self {
        Self {
            forward_step: c.forward_step.clone(),
            reverse_step: c.reverse_step.clone(),
            forward_minute: u64::from(c.forward_minute),
            reverse_minute: u64::from(c.reverse_minute),
            total_hours: u64::from(c.total_hours),
        }
    }
}

// ── StepBook ─────────────────────────────────────────────────────────────────

/// Resolve a pump or valve letter to its board address and output pin.
pub fn resolve_output(cfg: &fluidics_config::Config, letter: &str) -> Result<OutputAddr, FluidicsError> {
    let out = cfg
        .address_map
        .get(letter)
        .ok_or_else(|| FluidicsError::Config(format!("address_map has no entry for '{letter}'")))?;
    let pin = output_pin(out.index).ok_or_else(|| {
        FluidicsError::Config(format!("address_map.{letter}.index {} is not an output", out.index))
    })?;
    Ok(OutputAddr {
        address: out.addr,
        pin,
    })
}

fn step_from_cfg(
    cfg: &fluidics_config::Config,
    s: &fluidics_config::StepCfg,
) -> Result<StepDescriptor, FluidicsError> {
    let pumps = s
        .pump
        .iter()
        .map(|p| resolve_output(cfg, p))
        .collect::<Result<Vec<_>, _>>()?;
    let valves = s
        .valves
        .iter()
        .map(|v| {
            let branch = Branch::from_path(v.path).ok_or_else(|| {
                FluidicsError::Config(format!("step '{}': valve path {} is not 0 or 1", s.label, v.path))
            })?;
            Ok(ValveSetting {
                output: resolve_output(cfg, &v.valve)?,
                branch,
            })
        })
        .collect::<Result<Vec<_>, FluidicsError>>()?;
    let switches = s
        .switches
        .iter()
        .map(|sw| RawSwitch {
            pin: sw.pin,
            high: sw.level != 0,
        })
        .collect();
    let pulse_count = s
        .pulses
        .or_else(|| s.volume.map(|v| cfg.defaults.pulses_for_volume(v)));
    Ok(StepDescriptor {
        label: s.label.clone(),
        group: s.group.clone(),
        pumps,
        valves,
        switches,
        pulse_count,
        period_s: s.period,
    })
}

impl TryFrom<&fluidics_config::Config> for StepBook {
    type Error = FluidicsError;

    fn try_from(cfg: &fluidics_config::Config) -> Result<Self, Self::Error> {
        cfg.steps
            .iter()
            .map(|s| step_from_cfg(cfg, s))
            .collect::<Result<Vec<_>, _>>()
            .map(StepBook::new)
    }
}
