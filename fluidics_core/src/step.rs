//! Declarative step descriptions resolved against the address map.
use crate::valve::Branch;

/// A board output: bus address plus board pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputAddr {
    pub address: u8,
    pub pin: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveSetting {
    pub output: OutputAddr,
    pub branch: Branch,
}

/// Local GPIO level set without bus framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSwitch {
    pub pin: u8,
    pub high: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub label: String,
    pub group: Option<String>,
    /// Run concurrently, in this order of start.
    pub pumps: Vec<OutputAddr>,
    pub valves: Vec<ValveSetting>,
    pub switches: Vec<RawSwitch>,
    pub pulse_count: Option<u32>,
    pub period_s: Option<f64>,
}

impl StepDescriptor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            group: None,
            pumps: Vec::new(),
            valves: Vec::new(),
            switches: Vec::new(),
            pulse_count: None,
            period_s: None,
        }
    }

    pub fn with_pump(mut self, address: u8, pin: u8) -> Self {
        self.pumps.push(OutputAddr { address, pin });
        self
    }

    pub fn with_valve(mut self, address: u8, pin: u8, branch: Branch) -> Self {
        self.valves.push(ValveSetting {
            output: OutputAddr { address, pin },
            branch,
        });
        self
    }

    pub fn with_switch(mut self, pin: u8, high: bool) -> Self {
        self.switches.push(RawSwitch { pin, high });
        self
    }

    pub fn with_pulses(mut self, pulses: u32) -> Self {
        self.pulse_count = Some(pulses);
        self
    }

    pub fn with_period(mut self, period_s: f64) -> Self {
        self.period_s = Some(period_s);
        self
    }
}

/// Every configured step, in configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepBook {
    steps: Vec<StepDescriptor>,
}

impl StepBook {
    pub fn new(steps: Vec<StepDescriptor>) -> Self {
        Self { steps }
    }

    pub fn get(&self, label: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
