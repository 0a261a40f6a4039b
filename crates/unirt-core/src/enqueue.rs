//! Command enqueue entry points.
//!
//! Every command follows the same protocol:
//!
//! 1. bind the queue's device context ([`ScopedContext`]),
//! 2. resolve the stream and its dependency edges ([`ScopedStream`]),
//! 3. create and start the completion event if one was requested,
//! 4. submit the native work on the selected stream,
//! 5. record the event and hand it to the caller.
//!
//! A failure at any step leaves no event behind. The only host blocking
//! happens inside blocking buffer transfers.

use std::panic::{self, AssertUnwindSafe};

use crate::driver::Driver;
use crate::error::{panic_message, translate, Error, NativeResultExt, Result, ResultCode};
use crate::event::{CommandKind, EventHandle, PendingEvent};
use crate::guard::ScopedContext;
use crate::memory::Buffer;
use crate::queue::{Queue, StreamKind};
use crate::stream::{ScopedStream, WaitList};

/// Properties of a native-escape command. Reserved for future use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeCommandProperties {
    /// Reserved; must be zero.
    pub flags: u32,
}

fn enqueue_command<D, F>(
    queue: &Queue<D>,
    kind: CommandKind,
    stream_kind: StreamKind,
    wait_list: WaitList<'_, D>,
    want_event: bool,
    submit: F,
) -> Result<Option<EventHandle<D>>>
where
    D: Driver,
    F: FnOnce(&ScopedStream<'_, D>) -> Result<()>,
{
    queue.ensure_live()?;
    let _active = ScopedContext::new(queue.device())?;
    let stream = ScopedStream::with_kind(queue, stream_kind, wait_list)?;

    let pending = if want_event {
        let pending = PendingEvent::new(EventHandle::create(kind, &stream)?);
        pending.handle().start()?;
        Some(pending)
    } else {
        None
    };

    submit(&stream)?;

    match pending {
        Some(pending) => {
            pending.handle().record()?;
            Ok(Some(pending.publish()))
        }
        None => Ok(None),
    }
}

impl<D: Driver> Queue<D> {
    /// Runs caller-supplied native work on the stream selected for it.
    ///
    /// `callback` receives this queue and `data`. It must submit its work to
    /// the stream returned by [`Queue::native_handle`], which inside the
    /// callback is the stream every wait-list dependency was ordered on. The
    /// returned event completes once that work has completed.
    ///
    /// A native status returned by the callback is translated; a panic in
    /// the callback is reported as [`Error::Panicked`].
    pub fn enqueue_native_command<T, F>(
        &self,
        callback: F,
        data: &mut T,
        properties: Option<&NativeCommandProperties>,
        wait_list: WaitList<'_, D>,
        want_event: bool,
    ) -> Result<Option<EventHandle<D>>>
    where
        F: FnOnce(&Queue<D>, &mut T) -> std::result::Result<(), D::Status>,
    {
        if let Some(properties) = properties {
            tracing::trace!(flags = properties.flags, "Ignoring native command properties");
        }

        enqueue_command(
            self,
            CommandKind::EnqueueNative,
            StreamKind::Compute,
            wait_list,
            want_event,
            |stream| {
                let queue = stream.queue();
                match panic::catch_unwind(AssertUnwindSafe(|| callback(queue, data))) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(status)) => Err(translate(D::NAME, "native_command", status)),
                    Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
                }
            },
        )
    }

    /// Orders a marker command after `wait_list`.
    ///
    /// With an empty wait-list the marker waits for everything previously
    /// submitted to the queue.
    pub fn enqueue_events_wait(
        &self,
        wait_list: WaitList<'_, D>,
        want_event: bool,
    ) -> Result<Option<EventHandle<D>>> {
        let join_queue = wait_list.count() == 0;
        enqueue_command(
            self,
            CommandKind::EventsWait,
            StreamKind::Compute,
            wait_list,
            want_event,
            |stream| {
                if join_queue {
                    stream.wait_for_queue()?;
                }
                Ok(())
            },
        )
    }

    /// Like [`enqueue_events_wait`](Self::enqueue_events_wait), and every
    /// command submitted to the queue afterwards also waits for it.
    pub fn enqueue_events_wait_with_barrier(
        &self,
        wait_list: WaitList<'_, D>,
        want_event: bool,
    ) -> Result<Option<EventHandle<D>>> {
        let join_queue = wait_list.count() == 0;
        enqueue_command(
            self,
            CommandKind::EventsWaitWithBarrier,
            StreamKind::Compute,
            wait_list,
            want_event,
            |stream| {
                if join_queue {
                    stream.wait_for_queue()?;
                }
                stream.fence_queue()
            },
        )
    }

    /// Copies `data` into `buffer` at `offset`.
    ///
    /// Non-blocking writes copy `data` up front, so the caller may reuse it
    /// immediately.
    pub fn enqueue_buffer_write(
        &self,
        buffer: &Buffer<D>,
        blocking: bool,
        offset: usize,
        data: &[u8],
        wait_list: WaitList<'_, D>,
        want_event: bool,
    ) -> Result<Option<EventHandle<D>>> {
        self.check_buffer(buffer, offset, data.len())?;
        let ptr = buffer.device_ptr()?;
        enqueue_command(
            self,
            CommandKind::MemBufferWrite,
            StreamKind::Transfer,
            wait_list,
            want_event,
            |stream| {
                let driver = self.device().driver();
                driver
                    .memcpy_htod_async(stream.stream(), ptr, offset, data.to_vec())
                    .native(D::NAME, "memcpy_htod_async")?;
                if blocking {
                    driver
                        .stream_synchronize(stream.stream())
                        .native(D::NAME, "stream_synchronize")?;
                }
                Ok(())
            },
        )
    }

    /// Copies `buffer[offset..offset + out.len()]` into `out`.
    ///
    /// Reads always block until the data is available.
    pub fn enqueue_buffer_read(
        &self,
        buffer: &Buffer<D>,
        offset: usize,
        out: &mut [u8],
        wait_list: WaitList<'_, D>,
        want_event: bool,
    ) -> Result<Option<EventHandle<D>>> {
        self.check_buffer(buffer, offset, out.len())?;
        let ptr = buffer.device_ptr()?;
        enqueue_command(
            self,
            CommandKind::MemBufferRead,
            StreamKind::Transfer,
            wait_list,
            want_event,
            |stream| {
                self.device()
                    .driver()
                    .memcpy_dtoh(stream.stream(), ptr, offset, out)
                    .native(D::NAME, "memcpy_dtoh")
            },
        )
    }

    fn check_buffer(&self, buffer: &Buffer<D>, offset: usize, len: usize) -> Result<()> {
        if !buffer.context().device().same_device(self.device()) {
            return Err(Error::usage(
                ResultCode::InvalidContext,
                format!(
                    "buffer {} lives on device {}, queue {} on device {}",
                    buffer.id(),
                    buffer.context().device().ordinal(),
                    self.id(),
                    self.device().ordinal()
                ),
            ));
        }
        buffer.check_range(offset, len)
    }
}
