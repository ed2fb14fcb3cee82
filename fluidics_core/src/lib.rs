#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core actuation logic for the fluidics rig (hardware-agnostic).
//!
//! All bus traffic goes through `fluidics_traits::I2cBus`; local GPIO through
//! `fluidics_traits::SwitchBank`.
//!
//! ## Architecture
//!
//! - **Protocol**: framed command/response exchange with `base_node` boards (`protocol`)
//! - **Record**: the persistent configuration record (`record`)
//! - **Board**: motor board pin map, setup and identify (`board`)
//! - **Actuators**: valve level writes (`valve`) and cancellable pulse trains (`pump`)
//! - **Sequencer**: named steps with stop-then-restart semantics (`sequencer`)
//! - **Program**: the timed two-branch mix schedule (`program`)

pub mod board;
pub mod config;
pub mod conversions;
pub mod error;
pub mod hw_error;
pub mod mocks;
pub mod program;
pub mod protocol;
pub mod pump;
pub mod record;
pub mod sequencer;
pub mod status;
pub mod step;
pub mod util;
pub mod valve;

pub use board::{BoardInfo, ENABLE_PINS, OUTPUT_PINS};
pub use config::{BusTiming, ProgramPlan, PumpDefaults};
pub use error::{CommandError, FluidicsError, Report, Result};
pub use program::{ProgramRunner, ProgramState, StepRunner, TickOutcome, TimedProgram};
pub use protocol::{CommandChannel, Opcode, ProtocolError, SharedBus};
pub use pump::{PulsePlan, PumpOutcome, RunningPump};
pub use record::{CONFIG_RECORD_SIZE, ConfigRecord};
pub use sequencer::{ApplyOverrides, ApplyReport, Sequencer};
pub use status::{PumpStatus, StepStatus};
pub use step::{OutputAddr, RawSwitch, StepBook, StepDescriptor, ValveSetting};
pub use valve::Branch;
