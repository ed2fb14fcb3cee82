//! Maps `Box<dyn Error>` from trait boundaries to typed `CommandError`.
//!
//! The traits in `fluidics_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed error enum, with an optional
//! feature-gated path for `fluidics_hardware::HwError` downcasting.

use crate::error::CommandError;

/// Map a bus-level error to a typed `CommandError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to the error's display text.
pub fn map_bus_error(e: &(dyn std::error::Error + 'static)) -> CommandError {
    #[cfg(feature = "hardware-errors")]
    {
        use fluidics_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::ShortTransfer { .. } => CommandError::Decode(hw.to_string()),
                other => CommandError::Bus(other.to_string()),
            };
        }
    }

    CommandError::Bus(e.to_string())
}
