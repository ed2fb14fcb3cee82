pub mod error;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod rpi;
pub mod sim;

pub use sim::{PinEvent, SimulatedBoard, SimulatedBus, SimulatedSwitches};

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use rpi::{RppalBus, RppalSwitches};
