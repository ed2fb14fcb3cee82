//! Read-only snapshots of what the sequencer is doing, for display.

/// One pump of a running step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub address: u8,
    pub pin: u8,
    pub pulses: u32,
    pub remaining: u32,
    pub on_ms: u64,
    pub off_ms: u64,
}

/// A step label with at least one pump still pulsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub label: String,
    pub run_id: u64,
    pub pumps: Vec<PumpStatus>,
}

impl StepStatus {
    /// Pulses still to go across every pump of the step.
    pub fn remaining(&self) -> u64 {
        self.pumps.iter().map(|p| u64::from(p.remaining)).sum()
    }
}
