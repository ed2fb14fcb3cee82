//! Stand-ins for rigs without local switch outputs.

/// A switch bank that only logs. Used when no GPIO backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSwitches;

impl fluidics_traits::SwitchBank for NoopSwitches {
    fn set_level(
        &mut self,
        pin: u8,
        high: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::debug!(pin, high, "switch ignored (no gpio backend)");
        Ok(())
    }
}
