//! Runtime settings used by the sequencer and the timed program, decoupled
//! from the TOML schema in `fluidics_config`.
use crate::util::{DEFAULT_MIN_OFF_MS, DEFAULT_ON_MS};
use std::time::Duration;

/// Fallbacks for pump steps that do not carry their own pulse count or period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpDefaults {
    pub on_ms: u64,
    pub min_off_ms: u64,
    pub pulses: u32,
    pub period_s: f64,
}

impl Default for PumpDefaults {
    fn default() -> Self {
        Self {
            on_ms: DEFAULT_ON_MS,
            min_off_ms: DEFAULT_MIN_OFF_MS,
            // 1 mL at 20 uL per stroke, 5 mL/min
            pulses: 50,
            period_s: 0.24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    /// Delay between a command write and its reply read
    pub settle: Duration,
    /// Delay after persistent writes before load-config
    pub write_settle: Duration,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            settle: crate::protocol::DEFAULT_SETTLE,
            write_settle: Duration::from_millis(10),
        }
    }
}

/// Two-branch alternating schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramPlan {
    pub forward_step: String,
    pub reverse_step: String,
    pub forward_minute: u64,
    pub reverse_minute: u64,
    pub total_hours: u64,
}

impl Default for ProgramPlan {
    fn default() -> Self {
        Self {
            forward_step: "A -> B".into(),
            reverse_step: "B -> A".into(),
            forward_minute: 0,
            reverse_minute: 30,
            total_hours: 16,
        }
    }
}
