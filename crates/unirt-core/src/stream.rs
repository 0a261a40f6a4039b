//! Stream selection for commands with cross-stream wait-lists.
//!
//! [`ScopedStream`] resolves the single native stream a new command runs on
//! and, before returning, makes that stream wait on every wait-list event
//! recorded elsewhere. The waits are device-side (`stream_wait_event`), so
//! the host never blocks here.

use std::fmt;

use crate::driver::{Driver, EventFlags};
use crate::error::{Error, NativeResultExt, Result, ResultCode};
use crate::event::EventHandle;
use crate::queue::{Queue, StreamKind, StreamSelection};

/// Events a new command depends on.
///
/// Mirrors the `(count, pointer)` pair of the runtime ABI: the count and the
/// slice are checked against each other before anything else happens.
pub struct WaitList<'a, D: Driver> {
    count: u32,
    events: Option<&'a [EventHandle<D>]>,
}

impl<'a, D: Driver> WaitList<'a, D> {
    /// Wait-list from an explicit count and optional slice.
    #[must_use]
    pub fn new(count: u32, events: Option<&'a [EventHandle<D>]>) -> Self {
        Self { count, events }
    }

    /// No dependencies.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            count: 0,
            events: None,
        }
    }

    /// Declared number of entries.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Checks the count against the slice and returns the entries.
    pub fn resolve(&self) -> Result<&'a [EventHandle<D>]> {
        match (self.count, self.events) {
            (0, None) => Ok(&[]),
            (0, Some(_)) => Err(Error::usage(
                ResultCode::InvalidEventWaitList,
                "wait-list given with a zero count",
            )),
            (count, None) => Err(Error::usage(
                ResultCode::InvalidEventWaitList,
                format!("wait-list count is {count} but no wait-list was given"),
            )),
            (count, Some(events)) if events.len() != count as usize => Err(Error::usage(
                ResultCode::InvalidEventWaitList,
                format!(
                    "wait-list count is {count} but {} events were given",
                    events.len()
                ),
            )),
            (_, Some(events)) => Ok(events),
        }
    }
}

impl<'a, D: Driver> From<&'a [EventHandle<D>]> for WaitList<'a, D> {
    fn from(events: &'a [EventHandle<D>]) -> Self {
        if events.is_empty() {
            Self::empty()
        } else {
            Self::new(events.len() as u32, Some(events))
        }
    }
}

impl<'a, D: Driver> From<&'a Vec<EventHandle<D>>> for WaitList<'a, D> {
    fn from(events: &'a Vec<EventHandle<D>>) -> Self {
        Self::from(events.as_slice())
    }
}

impl<D: Driver> Clone for WaitList<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Driver> Copy for WaitList<'_, D> {}

impl<D: Driver> Default for WaitList<'_, D> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<D: Driver> fmt::Debug for WaitList<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitList")
            .field("count", &self.count)
            .field("events", &self.events.map(<[EventHandle<D>]>::len))
            .finish()
    }
}

/// The native stream selected for one command, with its dependencies
/// already enforced.
///
/// While the guard is alive the selected stream is what
/// [`Queue::native_handle`] returns on this thread.
#[must_use = "the selected stream is unpublished as soon as the guard is dropped"]
pub struct ScopedStream<'q, D: Driver> {
    queue: &'q Queue<D>,
    selection: StreamSelection<D>,
    previous_interop: Option<D::Stream>,
}

impl<'q, D: Driver> ScopedStream<'q, D> {
    /// Selects a compute stream for `queue` honoring `wait_list`.
    pub fn new(queue: &'q Queue<D>, wait_list: WaitList<'_, D>) -> Result<Self> {
        Self::with_kind(queue, StreamKind::Compute, wait_list)
    }

    /// Selects a stream of `kind` for `queue` honoring `wait_list`.
    ///
    /// The queue's context must be current. Either every dependency edge is
    /// in place when this returns, or the whole selection failed.
    pub fn with_kind(
        queue: &'q Queue<D>,
        kind: StreamKind,
        wait_list: WaitList<'_, D>,
    ) -> Result<Self> {
        let events = wait_list.resolve()?;
        validate_wait_list(queue, events)?;

        let selection = queue.select_stream(kind, events);
        let waits = enqueue_wait_edges(queue, selection.stream(), events)?;

        tracing::debug!(
            backend = D::NAME,
            queue = %queue.id(),
            slot = ?selection.slot(),
            token = selection.token(),
            wait_list = events.len(),
            waits,
            "Selected stream"
        );

        let previous_interop = queue.publish_interop(selection.stream());
        Ok(Self {
            queue,
            selection,
            previous_interop,
        })
    }

    /// Selected native stream.
    pub fn stream(&self) -> D::Stream {
        self.selection.stream()
    }

    /// Full selection.
    pub fn selection(&self) -> &StreamSelection<D> {
        &self.selection
    }

    /// Queue the stream belongs to.
    pub fn queue(&self) -> &'q Queue<D> {
        self.queue
    }

    /// Makes the selected stream wait for everything already submitted to
    /// the queue's other streams.
    pub fn wait_for_queue(&self) -> Result<()> {
        let target = self.stream();
        for source in self.queue.all_streams().filter(|&s| s != target) {
            link_streams(self.queue.device().driver(), source, target)?;
        }
        Ok(())
    }

    /// Makes every other stream of the queue wait for what was submitted to
    /// the selected stream so far.
    pub fn fence_queue(&self) -> Result<()> {
        let source = self.stream();
        for target in self.queue.all_streams().filter(|&s| s != source) {
            link_streams(self.queue.device().driver(), source, target)?;
        }
        Ok(())
    }
}

impl<D: Driver> Drop for ScopedStream<'_, D> {
    fn drop(&mut self) {
        self.queue.restore_interop(self.previous_interop);
    }
}

/// Orders the future work of `target` after the current tail of `source`
/// through a throwaway marker event.
fn link_streams<D: Driver>(driver: &D, source: D::Stream, target: D::Stream) -> Result<()> {
    let marker = driver
        .event_create(EventFlags::DisableTiming)
        .native(D::NAME, "event_create")?;
    let linked = driver
        .event_record(&marker, source)
        .native(D::NAME, "event_record")
        .and_then(|()| {
            driver
                .stream_wait_event(target, &marker)
                .native(D::NAME, "stream_wait_event")
        });
    let destroyed = driver
        .event_destroy(marker)
        .native(D::NAME, "event_destroy");
    linked.and(destroyed)
}

fn validate_wait_list<D: Driver>(queue: &Queue<D>, events: &[EventHandle<D>]) -> Result<()> {
    for event in events {
        event.ensure_live()?;
        if !event.queue().device().same_device(queue.device()) {
            return Err(Error::usage(
                ResultCode::InvalidEventWaitList,
                format!(
                    "event {} belongs to device {}, queue {} to device {}",
                    event.id(),
                    event.queue().device().ordinal(),
                    queue.id(),
                    queue.device().ordinal()
                ),
            ));
        }
    }
    Ok(())
}

/// Inserts a device-side wait on `stream` for every event recorded on
/// another stream. Returns the number of waits inserted.
fn enqueue_wait_edges<D: Driver>(
    queue: &Queue<D>,
    stream: D::Stream,
    events: &[EventHandle<D>],
) -> Result<usize> {
    let driver = queue.device().driver();
    let mut inserted = 0;

    for event in events {
        if event.stream() == stream {
            continue;
        }
        if queue.config().skip_completed_waits && event.is_complete()? {
            continue;
        }
        event
            .native_handle(|native| driver.stream_wait_event(stream, native))?
            .native(D::NAME, "stream_wait_event")?;
        inserted += 1;
    }

    Ok(inserted)
}
