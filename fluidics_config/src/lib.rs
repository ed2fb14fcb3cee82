#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the fluidics rig.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `address_map` resolves the logical pump/valve letters used by `[[steps]]`
//!   to a motor board bus address and output index.
//! - `Defaults` carries the volume/flow constants used to turn volume hints
//!   into pulse counts and periods.
use serde::Deserialize;
use serde::de::Deserializer;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Highest output index on a motor board (IN1..IN4).
pub const MAX_OUTPUT_INDEX: u8 = 3;

/// Location of one pump or valve output.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct OutputRef {
    /// I2C address of the motor board
    pub addr: u8,
    /// Output index (0-3) within the board
    pub index: u8,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BusCfg {
    /// Linux I2C bus number (`/dev/i2c-N`)
    pub i2c_bus: u8,
    /// Delay between a command write and its reply read (us)
    pub settle_us: u64,
    /// Delay after persistent writes before load-config (ms)
    pub write_settle_ms: u64,
}

impl Default for BusCfg {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            settle_us: 1000,
            write_settle_ms: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Volume moved by one pump stroke (litres)
    pub litres_per_pulse: f64,
    /// Nominal pump flow rate (litres per minute), used to derive the default period
    pub litres_per_minute: f64,
    /// Volume dispensed by a step with neither `pulses` nor `volume`
    pub volume_l: f64,
    /// Pump "on" duration per pulse (ms)
    pub on_ms: u64,
    /// Floor for the pump "off" duration (ms)
    pub min_off_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            litres_per_pulse: 20e-6,
            litres_per_minute: 5e-3,
            volume_l: 1e-3,
            on_ms: 50,
            min_off_ms: 150,
        }
    }
}

impl Defaults {
    /// Pulses needed to move `volume_l` litres, at least one.
    pub fn pulses_for_volume(&self, volume_l: f64) -> u32 {
        let n = (volume_l / self.litres_per_pulse).round();
        if !n.is_finite() || n < 1.0 {
            1
        } else if n >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            n as u32
        }
    }

    /// Pulse period (s) that yields the nominal flow rate.
    pub fn default_period_s(&self) -> f64 {
        60.0 * self.litres_per_pulse / self.litres_per_minute
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ValveCfg {
    /// Letter from `address_map`
    pub valve: String,
    /// 0 = branch A, 1 = branch B
    pub path: u8,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SwitchCfg {
    /// Local GPIO pin
    pub pin: u8,
    /// 0 = low, 1 = high
    pub level: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StepCfg {
    pub label: String,
    /// Operator-facing section the step belongs to
    #[serde(default)]
    pub group: Option<String>,
    /// One pump letter or a list of letters run concurrently.
    #[serde(default, deserialize_with = "de_pumps")]
    pub pump: Vec<String>,
    #[serde(default)]
    pub valves: Vec<ValveCfg>,
    #[serde(default)]
    pub switches: Vec<SwitchCfg>,
    pub pulses: Option<u32>,
    /// Volume hint in litres; converted with `defaults.litres_per_pulse`
    pub volume: Option<f64>,
    /// Pulse period in seconds
    pub period: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PumpToml {
    One(String),
    Many(Vec<String>),
}

fn de_pumps<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<PumpToml> = Option::deserialize(deserializer)?;
    Ok(match opt {
        None => Vec::new(),
        Some(PumpToml::One(p)) => vec![p],
        Some(PumpToml::Many(ps)) => ps,
    })
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProgramCfg {
    /// Step applied at `forward_minute` while on branch A
    pub forward_step: String,
    /// Step applied at `reverse_minute` while on branch B
    pub reverse_step: String,
    pub forward_minute: u32,
    pub reverse_minute: u32,
    /// Program stops itself after this many hours
    pub total_hours: u32,
    /// Tick period (ms)
    pub tick_ms: u64,
}

impl Default for ProgramCfg {
    fn default() -> Self {
        Self {
            forward_step: "A -> B".to_string(),
            reverse_step: "B -> A".to_string(),
            forward_minute: 0,
            reverse_minute: 30,
            total_hours: 16,
            tick_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusCfg,
    #[serde(default)]
    pub defaults: Defaults,
    pub address_map: BTreeMap<String, OutputRef>,
    #[serde(default)]
    pub steps: Vec<StepCfg>,
    /// Timed mix program; absent disables `program` runs
    #[serde(default)]
    pub program: Option<ProgramCfg>,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))
}

impl Config {
    pub fn step(&self, label: &str) -> Option<&StepCfg> {
        self.steps.iter().find(|s| s.label == label)
    }

    pub fn resolve(&self, letter: &str) -> eyre::Result<OutputRef> {
        self.address_map
            .get(letter)
            .copied()
            .ok_or_else(|| eyre::eyre!("address_map has no entry for '{letter}'"))
    }

    /// Every board address referenced by `address_map`.
    pub fn bus_addresses(&self) -> BTreeSet<u8> {
        self.address_map.values().map(|o| o.addr).collect()
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // Bus
        if self.bus.settle_us > 1_000_000 {
            eyre::bail!("bus.settle_us is unreasonably large (>1s)");
        }

        // Defaults
        if !(self.defaults.litres_per_pulse > 0.0 && self.defaults.litres_per_pulse.is_finite()) {
            eyre::bail!("defaults.litres_per_pulse must be > 0");
        }
        if !(self.defaults.litres_per_minute > 0.0 && self.defaults.litres_per_minute.is_finite())
        {
            eyre::bail!("defaults.litres_per_minute must be > 0");
        }
        if !(self.defaults.volume_l > 0.0 && self.defaults.volume_l.is_finite()) {
            eyre::bail!("defaults.volume_l must be > 0");
        }
        if self.defaults.on_ms == 0 {
            eyre::bail!("defaults.on_ms must be >= 1");
        }

        // Address map
        for (letter, out) in &self.address_map {
            if out.index > MAX_OUTPUT_INDEX {
                eyre::bail!("address_map.{letter}.index must be in 0..=3");
            }
            if out.addr == 0 || out.addr > 0x77 {
                eyre::bail!("address_map.{letter}.addr must be a 7-bit device address");
            }
        }

        // Steps
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.label.trim().is_empty() {
                eyre::bail!("steps: label must not be empty");
            }
            if !seen.insert(step.label.as_str()) {
                eyre::bail!("steps: duplicate label '{}'", step.label);
            }
            for p in &step.pump {
                if !self.address_map.contains_key(p) {
                    eyre::bail!("step '{}': unknown pump '{p}'", step.label);
                }
            }
            for v in &step.valves {
                if !self.address_map.contains_key(&v.valve) {
                    eyre::bail!("step '{}': unknown valve '{}'", step.label, v.valve);
                }
                if v.path > 1 {
                    eyre::bail!("step '{}': valve path must be 0 or 1", step.label);
                }
            }
            for s in &step.switches {
                if s.level > 1 {
                    eyre::bail!("step '{}': switch level must be 0 or 1", step.label);
                }
            }
            if step.pulses == Some(0) {
                eyre::bail!("step '{}': pulses must be >= 1", step.label);
            }
            if let Some(v) = step.volume
                && !(v > 0.0 && v.is_finite())
            {
                eyre::bail!("step '{}': volume must be > 0", step.label);
            }
            if let Some(p) = step.period
                && !(p > 0.0 && p.is_finite())
            {
                eyre::bail!("step '{}': period must be > 0", step.label);
            }
        }

        // Program
        if let Some(prog) = &self.program {
            for label in [&prog.forward_step, &prog.reverse_step] {
                if self.step(label).is_none() {
                    eyre::bail!("program step '{label}' is not defined in [[steps]]");
                }
            }
            if prog.forward_minute >= 60 || prog.reverse_minute >= 60 {
                eyre::bail!("program minutes must be in 0..60");
            }
            if prog.forward_minute == prog.reverse_minute {
                eyre::bail!("program.forward_minute and program.reverse_minute must differ");
            }
            if prog.total_hours == 0 {
                eyre::bail!("program.total_hours must be >= 1");
            }
            if prog.tick_ms == 0 || prog.tick_ms > 60_000 {
                eyre::bail!("program.tick_ms must be in 1..=60000");
            }
        }

        Ok(())
    }
}
