//! Device buffers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Context;
use crate::driver::Driver;
use crate::error::{Error, NativeResultExt, Result, ResultCode};
use crate::guard::ScopedContext;
use crate::handle::{HandleId, RefCount};

/// A device allocation owned by a context.
///
/// Cloning a `Buffer` copies the handle; it does not add a reference.
pub struct Buffer<D: Driver> {
    inner: Arc<BufferInner<D>>,
}

struct BufferInner<D: Driver> {
    id: HandleId,
    context: Context<D>,
    size: usize,
    ref_count: RefCount,
    ptr: Mutex<Option<D::DevicePtr>>,
}

impl<D: Driver> Buffer<D> {
    /// Allocates `size` bytes on the context's device.
    pub fn new(context: &Context<D>, size: usize) -> Result<Self> {
        context.ensure_live()?;
        if size == 0 {
            return Err(Error::usage(
                ResultCode::InvalidValue,
                "buffer size must be non-zero",
            ));
        }

        let device = context.device();
        let ptr = {
            let _active = ScopedContext::new(device)?;
            device
                .driver()
                .mem_alloc(size)
                .native(D::NAME, "mem_alloc")?
        };
        if let Err(err) = context.retain() {
            let _active = ScopedContext::new(device)?;
            if let Err(status) = device.driver().mem_free(ptr) {
                tracing::warn!(backend = D::NAME, %status, "Failed to free unowned allocation");
            }
            return Err(err);
        }

        let buffer = Self {
            inner: Arc::new(BufferInner {
                id: HandleId::next(),
                context: context.clone(),
                size,
                ref_count: RefCount::new(),
                ptr: Mutex::new(Some(ptr)),
            }),
        };
        tracing::debug!(backend = D::NAME, buffer = %buffer.id(), size, "Allocated buffer");
        Ok(buffer)
    }

    /// Handle identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Owning context.
    pub fn context(&self) -> &Context<D> {
        &self.inner.context
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.get()
    }

    /// Device address, failing with `InvalidMemObject` once released.
    pub fn device_ptr(&self) -> Result<D::DevicePtr> {
        (*self.inner.ptr.lock()).ok_or_else(|| {
            Error::usage(
                ResultCode::InvalidMemObject,
                format!("buffer {} was released", self.id()),
            )
        })
    }

    /// Checks that `len` bytes at `offset` lie inside the buffer.
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.size => Ok(()),
            _ => Err(Error::usage(
                ResultCode::InvalidSize,
                format!(
                    "range {offset}+{len} exceeds buffer {} of {} bytes",
                    self.id(),
                    self.inner.size
                ),
            )),
        }
    }

    /// Adds a reference.
    pub fn retain(&self) -> Result<()> {
        if !self.inner.ref_count.retain() {
            return Err(Error::usage(
                ResultCode::InvalidMemObject,
                format!("retain of released buffer {}", self.id()),
            ));
        }
        Ok(())
    }

    /// Drops a reference, freeing the allocation on the last one.
    pub fn release(&self) -> Result<()> {
        match self.inner.ref_count.release() {
            Some(true) => {
                let freed = match self.inner.ptr.lock().take() {
                    Some(ptr) => {
                        let device = self.inner.context.device();
                        ScopedContext::new(device).and_then(|_active| {
                            device.driver().mem_free(ptr).native(D::NAME, "mem_free")
                        })
                    }
                    None => Ok(()),
                };
                tracing::debug!(backend = D::NAME, buffer = %self.id(), "Released buffer");
                freed.and(self.inner.context.release())
            }
            Some(false) => Ok(()),
            None => Err(Error::usage(
                ResultCode::InvalidMemObject,
                format!("release of released buffer {}", self.id()),
            )),
        }
    }
}

impl<D: Driver> Clone for Buffer<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
