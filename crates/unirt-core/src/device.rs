//! Devices and contexts.

use std::fmt;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Error, NativeResultExt, Result, ResultCode};
use crate::handle::{HandleId, RefCount};

/// A device exposed by a driver, together with its native context.
pub struct Device<D: Driver> {
    inner: Arc<DeviceInner<D>>,
}

struct DeviceInner<D: Driver> {
    driver: Arc<D>,
    ordinal: usize,
    name: String,
    native: D::Context,
}

impl<D: Driver> Device<D> {
    /// Opens the device at `ordinal`.
    pub fn new(driver: Arc<D>, ordinal: usize) -> Result<Self> {
        let count = driver.device_count().native(D::NAME, "device_count")?;
        if ordinal >= count {
            return Err(Error::usage(
                ResultCode::InvalidDevice,
                format!("device ordinal {ordinal} out of range ({count} devices)"),
            ));
        }

        let native = driver
            .device_context(ordinal)
            .native(D::NAME, "device_context")?;
        let name = driver.device_name(ordinal).native(D::NAME, "device_name")?;

        Ok(Self {
            inner: Arc::new(DeviceInner {
                driver,
                ordinal,
                name,
                native,
            }),
        })
    }

    /// Opens every device of `driver`.
    pub fn all(driver: &Arc<D>) -> Result<Vec<Self>> {
        let count = driver.device_count().native(D::NAME, "device_count")?;
        (0..count)
            .map(|ordinal| Self::new(Arc::clone(driver), ordinal))
            .collect()
    }

    /// Device ordinal within its driver.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Native context of this device.
    pub fn native_context(&self) -> D::Context {
        self.inner.native
    }

    /// Owning driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Shared handle to the owning driver.
    pub fn driver_arc(&self) -> &Arc<D> {
        &self.inner.driver
    }

    /// Returns true if both handles name the same device of the same driver.
    #[must_use]
    pub fn same_device(&self, other: &Device<D>) -> bool {
        Arc::ptr_eq(&self.inner.driver, &other.inner.driver)
            && self.inner.ordinal == other.inner.ordinal
    }
}

impl<D: Driver> Clone for Device<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> PartialEq for Device<D> {
    fn eq(&self, other: &Self) -> bool {
        self.same_device(other)
    }
}

impl<D: Driver> fmt::Debug for Device<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &D::NAME)
            .field("ordinal", &self.inner.ordinal)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// A device-scoped execution environment.
///
/// Cloning a `Context` copies the handle; it does not add a reference.
/// Use [`retain`](Context::retain) and [`release`](Context::release).
pub struct Context<D: Driver> {
    inner: Arc<ContextInner<D>>,
}

struct ContextInner<D: Driver> {
    id: HandleId,
    device: Device<D>,
    ref_count: RefCount,
}

impl<D: Driver> Context<D> {
    /// Creates a context on `device`.
    pub fn new(device: &Device<D>) -> Result<Self> {
        let context = Self {
            inner: Arc::new(ContextInner {
                id: HandleId::next(),
                device: device.clone(),
                ref_count: RefCount::new(),
            }),
        };
        tracing::debug!(
            backend = D::NAME,
            context = %context.id(),
            device = device.ordinal(),
            "Created context"
        );
        Ok(context)
    }

    /// Handle identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// The context's device.
    pub fn device(&self) -> &Device<D> {
        &self.inner.device
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.get()
    }

    /// Fails with `InvalidContext` once the context was released.
    pub fn ensure_live(&self) -> Result<()> {
        if self.inner.ref_count.is_released() {
            return Err(Error::usage(
                ResultCode::InvalidContext,
                format!("context {} was released", self.id()),
            ));
        }
        Ok(())
    }

    /// Adds a reference.
    pub fn retain(&self) -> Result<()> {
        if !self.inner.ref_count.retain() {
            return Err(Error::usage(
                ResultCode::InvalidContext,
                format!("retain of released context {}", self.id()),
            ));
        }
        Ok(())
    }

    /// Drops a reference.
    pub fn release(&self) -> Result<()> {
        match self.inner.ref_count.release() {
            Some(true) => {
                tracing::debug!(backend = D::NAME, context = %self.id(), "Released context");
                Ok(())
            }
            Some(false) => Ok(()),
            None => Err(Error::usage(
                ResultCode::InvalidContext,
                format!("release of released context {}", self.id()),
            )),
        }
    }
}

impl<D: Driver> Clone for Context<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> PartialEq for Context<D> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<D: Driver> fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
