//! Scoped binding of a device's native context to the calling thread.

use crate::device::Device;
use crate::driver::Driver;
use crate::error::{NativeResultExt, Result};

/// Makes a device's native context current until the guard is dropped.
///
/// The context that was current when the guard was created is restored on
/// drop, which also covers early returns through `?` and unwinding. Guards
/// nest: an inner guard restores the outer guard's context.
///
/// ```ignore
/// let _active = ScopedContext::new(queue.device())?;
/// // native stream work for this device
/// ```
#[must_use = "the context is unbound as soon as the guard is dropped"]
pub struct ScopedContext<'a, D: Driver> {
    driver: &'a D,
    previous: Option<D::Context>,
    switched: bool,
}

impl<'a, D: Driver> ScopedContext<'a, D> {
    /// Binds `device`'s context on the calling thread.
    ///
    /// Fails before changing anything if the current context cannot be read,
    /// and leaves the previous binding in place if the switch fails.
    pub fn new(device: &'a Device<D>) -> Result<Self> {
        let driver = device.driver();
        let previous = driver
            .current_context()
            .native(D::NAME, "current_context")?;
        let desired = device.native_context();

        let switched = previous != Some(desired);
        if switched {
            driver
                .set_current_context(Some(desired))
                .native(D::NAME, "set_current_context")?;
        }

        Ok(Self {
            driver,
            previous,
            switched,
        })
    }

    /// Context that was current before this guard.
    pub fn previous(&self) -> Option<D::Context> {
        self.previous
    }
}

impl<D: Driver> Drop for ScopedContext<'_, D> {
    fn drop(&mut self) {
        if !self.switched {
            return;
        }
        if let Err(status) = self.driver.set_current_context(self.previous) {
            tracing::warn!(
                backend = D::NAME,
                %status,
                "Failed to restore previous context"
            );
        }
    }
}
