use crate::error::EmberResult;

/// Cooperative interrupt check, called by executors at safe points inside
/// long-running loops.
pub trait InterruptCheck {
    fn check_for_interrupts(&self) -> EmberResult<()>;
}

/// Never interrupts. Used by background paths and tests.
pub struct NoInterrupts;

impl InterruptCheck for NoInterrupts {
    fn check_for_interrupts(&self) -> EmberResult<()> {
        Ok(())
    }
}
