//! Completion events.
//!
//! An [`EventHandle`] wraps the native completion primitive of one command.
//! It is created on the stream the command runs on, started before the
//! command's native work is submitted and recorded right after it:
//!
//! ```text
//!   create ──► NotStarted ──start()──► Started ──record()──► Recorded
//!                                                               │
//!                                          native query ────────┴──► complete
//! ```
//!
//! Lifecycle transitions are made only by the enqueue call that owns the
//! event. Any other order is an internal-consistency violation.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Context;
use crate::driver::{Driver, EventFlags};
use crate::error::{Error, NativeResultExt, Result, ResultCode};
use crate::guard::ScopedContext;
use crate::handle::{HandleId, RefCount};
use crate::info::ProfilingInfo;
use crate::queue::{Queue, StreamId};
use crate::stream::ScopedStream;

/// Command that produced an event. Reported through
/// [`EventInfo::CommandType`](crate::info::EventInfo::CommandType).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Kernel launch.
    KernelLaunch = 0,
    /// Wait on a list of events.
    EventsWait = 1,
    /// Wait on a list of events, ordering all later commands after it.
    EventsWaitWithBarrier = 2,
    /// Device to host buffer read.
    MemBufferRead = 3,
    /// Host to device buffer write.
    MemBufferWrite = 4,
    /// Device to device buffer copy.
    MemBufferCopy = 5,
    /// Buffer fill.
    MemBufferFill = 6,
    /// Caller-supplied native work.
    EnqueueNative = 7,
}

/// Execution status reported through
/// [`EventInfo::CommandExecutionStatus`](crate::info::EventInfo::CommandExecutionStatus).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    /// The command finished.
    Complete = 0,
    /// The command was submitted and has not finished yet.
    Running = 1,
    /// The command is being submitted.
    Submitted = 2,
    /// The command has not been submitted.
    Queued = 3,
}

/// Lifecycle state of an event.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Created, native work not yet submitted.
    NotStarted = 0,
    /// Native work is being submitted.
    Started = 1,
    /// The native primitive was recorded after the work.
    Recorded = 2,
}

impl EventState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EventState::NotStarted,
            1 => EventState::Started,
            _ => EventState::Recorded,
        }
    }
}

/// Native primitives owned by one event.
struct NativeEvents<D: Driver> {
    end: D::Event,
    queued: Option<D::Event>,
    start: Option<D::Event>,
}

impl<D: Driver> NativeEvents<D> {
    fn create(driver: &D, profiling: bool) -> Result<Self> {
        let flags = if profiling {
            EventFlags::Default
        } else {
            EventFlags::DisableTiming
        };
        let end = driver.event_create(flags).native(D::NAME, "event_create")?;
        let mut events = Self {
            end,
            queued: None,
            start: None,
        };
        if profiling {
            let extra = driver
                .event_create(flags)
                .native(D::NAME, "event_create")
                .and_then(|queued| {
                    events.queued = Some(queued);
                    driver.event_create(flags).native(D::NAME, "event_create")
                });
            match extra {
                Ok(start) => events.start = Some(start),
                Err(err) => {
                    // The creation error wins over a cleanup failure.
                    if let Err(destroy_err) = events.destroy(driver) {
                        tracing::warn!(
                            backend = D::NAME,
                            error = %destroy_err,
                            "Failed to destroy partially created event"
                        );
                    }
                    return Err(err);
                }
            }
        }
        Ok(events)
    }

    fn destroy(self, driver: &D) -> Result<()> {
        let mut result = driver.event_destroy(self.end).native(D::NAME, "event_destroy");
        for event in [self.queued, self.start].into_iter().flatten() {
            result = result.and(driver.event_destroy(event).native(D::NAME, "event_destroy"));
        }
        result
    }
}

/// Reference-counted handle to a command's completion event.
///
/// Cloning an `EventHandle` copies the handle; it does not add a reference.
/// Use [`retain`](EventHandle::retain) and [`release`](EventHandle::release).
pub struct EventHandle<D: Driver> {
    inner: Arc<EventInner<D>>,
}

struct EventInner<D: Driver> {
    id: HandleId,
    kind: CommandKind,
    queue: Queue<D>,
    stream: D::Stream,
    slot: StreamId,
    token: u64,
    state: AtomicU8,
    seq: AtomicU64,
    ref_count: RefCount,
    /// `None` once the last reference was released.
    native: Mutex<Option<NativeEvents<D>>>,
}

impl<D: Driver> EventHandle<D> {
    /// Creates an event for a `kind` command on the stream selected by
    /// `stream`, retaining the stream's queue.
    ///
    /// Profiling queues also get the queued and start primitives.
    pub fn create(kind: CommandKind, stream: &ScopedStream<'_, D>) -> Result<Self> {
        let queue = stream.queue();
        queue.ensure_live()?;
        let driver = queue.device().driver();
        let native = NativeEvents::create(driver, queue.config().enable_profiling)?;
        if let Err(err) = queue.retain() {
            if let Err(destroy_err) = native.destroy(driver) {
                tracing::warn!(
                    backend = D::NAME,
                    queue = %queue.id(),
                    error = %destroy_err,
                    "Failed to destroy event of released queue"
                );
            }
            return Err(err);
        }

        let selection = stream.selection();
        let event = Self {
            inner: Arc::new(EventInner {
                id: HandleId::next(),
                kind,
                queue: queue.clone(),
                stream: selection.stream(),
                slot: selection.slot(),
                token: selection.token(),
                state: AtomicU8::new(EventState::NotStarted as u8),
                seq: AtomicU64::new(0),
                ref_count: RefCount::new(),
                native: Mutex::new(Some(native)),
            }),
        };

        tracing::debug!(
            backend = D::NAME,
            event = %event.id(),
            queue = %queue.id(),
            ?kind,
            slot = ?event.slot(),
            "Created event"
        );
        Ok(event)
    }

    /// Marks the start of the command's native work.
    ///
    /// On profiling queues the queued and start primitives are recorded on
    /// the bound stream first.
    pub fn start(&self) -> Result<()> {
        self.expect_state(EventState::NotStarted, "start")?;

        let driver = self.driver();
        self.with_native(|native| {
            for event in [&native.queued, &native.start].into_iter().flatten() {
                driver
                    .event_record(event, self.inner.stream)
                    .native(D::NAME, "event_record")?;
            }
            Ok(())
        })?;

        self.advance(EventState::NotStarted, EventState::Started, "start")
    }

    /// Records the completion primitive after the command's native work.
    pub fn record(&self) -> Result<()> {
        self.expect_state(EventState::Started, "record")?;

        let seq = self.inner.queue.next_event_seq();
        let driver = self.driver();
        self.with_native(|native| {
            driver
                .event_record(&native.end, self.inner.stream)
                .native(D::NAME, "event_record")
        })?;
        self.inner.seq.store(seq, Ordering::Release);

        self.advance(EventState::Started, EventState::Recorded, "record")?;
        tracing::debug!(backend = D::NAME, event = %self.id(), seq, "Recorded event");
        Ok(())
    }

    fn expect_state(&self, expected: EventState, transition: &str) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(Error::internal(format!(
                "{transition} of event {} in state {state:?}",
                self.id()
            )));
        }
        Ok(())
    }

    fn advance(&self, from: EventState, to: EventState, transition: &str) -> Result<()> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::internal(format!(
                    "{transition} of event {} raced into state {:?}",
                    self.id(),
                    EventState::from_u8(actual)
                ))
            })
    }

    /// Returns true once the recorded work has completed.
    ///
    /// Events that were not recorded yet are never complete.
    pub fn is_complete(&self) -> Result<bool> {
        if self.state() != EventState::Recorded {
            return Ok(false);
        }
        let _active = ScopedContext::new(self.inner.queue.device())?;
        let driver = self.driver();
        self.with_native(|native| driver.event_query(&native.end).native(D::NAME, "event_query"))
    }

    /// Current execution status.
    pub fn execution_status(&self) -> Result<EventStatus> {
        Ok(match self.state() {
            EventState::NotStarted => EventStatus::Queued,
            EventState::Started => EventStatus::Submitted,
            EventState::Recorded if self.is_complete()? => EventStatus::Complete,
            EventState::Recorded => EventStatus::Running,
        })
    }

    /// Blocks the calling thread until the event completes.
    pub fn wait(&self) -> Result<()> {
        self.ensure_live()?;
        if self.state() != EventState::Recorded {
            return Err(Error::internal(format!(
                "wait on event {} that was never recorded",
                self.id()
            )));
        }
        let _active = ScopedContext::new(self.inner.queue.device())?;
        let driver = self.driver();
        self.with_native(|native| {
            driver
                .event_synchronize(&native.end)
                .native(D::NAME, "event_synchronize")
        })
    }

    /// Blocks until every event in `events` completes.
    pub fn wait_all(events: &[EventHandle<D>]) -> Result<()> {
        if events.is_empty() {
            return Err(Error::usage(
                ResultCode::InvalidValue,
                "wait needs at least one event",
            ));
        }
        for event in events {
            event.ensure_live()?;
        }
        events.iter().try_for_each(EventHandle::wait)
    }

    /// Adds a reference.
    pub fn retain(&self) -> Result<()> {
        if !self.inner.ref_count.retain() {
            return Err(self.released("retain"));
        }
        Ok(())
    }

    /// Drops a reference. The last one destroys the native primitives and
    /// releases the queue.
    pub fn release(&self) -> Result<()> {
        match self.inner.ref_count.release() {
            Some(true) => self.teardown(),
            Some(false) => Ok(()),
            None => Err(self.released("release")),
        }
    }

    fn teardown(&self) -> Result<()> {
        let native = self.inner.native.lock().take();
        let destroyed = match native {
            Some(native) => ScopedContext::new(self.inner.queue.device())
                .and_then(|_active| native.destroy(self.driver())),
            None => Ok(()),
        };
        tracing::debug!(backend = D::NAME, event = %self.id(), "Released event");
        destroyed.and(self.inner.queue.release())
    }

    /// Profiling timestamp in nanoseconds, relative to the queue's
    /// profiling base.
    ///
    /// Needs a profiling queue and a completed event.
    pub fn profiling_info(&self, info: ProfilingInfo) -> Result<u64> {
        self.ensure_live()?;
        let queue = &self.inner.queue;
        if !queue.config().enable_profiling {
            return Err(Error::usage(
                ResultCode::ProfilingInfoNotAvailable,
                format!("queue {} was created without profiling", queue.id()),
            ));
        }
        if !self.is_complete()? {
            return Err(Error::usage(
                ResultCode::ProfilingInfoNotAvailable,
                format!("event {} has not completed", self.id()),
            ));
        }

        let _active = ScopedContext::new(queue.device())?;
        let driver = self.driver();
        self.with_native(|native| {
            let target = match info {
                ProfilingInfo::CommandQueued | ProfilingInfo::CommandSubmit => {
                    native.queued.as_ref()
                }
                ProfilingInfo::CommandStart => native.start.as_ref(),
                ProfilingInfo::CommandEnd | ProfilingInfo::CommandComplete => Some(&native.end),
            };
            let target = target.ok_or_else(|| {
                Error::usage(
                    ResultCode::ProfilingInfoNotAvailable,
                    "event has no profiling primitives",
                )
            })?;
            queue
                .with_profiling_base(|base| driver.event_elapsed_ns(base, target))
                .ok_or_else(|| {
                    Error::usage(
                        ResultCode::ProfilingInfoNotAvailable,
                        "queue has no profiling base",
                    )
                })?
                .native(D::NAME, "event_elapsed_ns")
        })
    }

    /// Runs `f` with the native completion primitive.
    pub fn native_handle<R>(&self, f: impl FnOnce(&D::Event) -> R) -> Result<R> {
        self.with_native(|native| Ok(f(&native.end)))
    }

    fn with_native<R>(&self, f: impl FnOnce(&NativeEvents<D>) -> Result<R>) -> Result<R> {
        let native = self.inner.native.lock();
        match native.as_ref() {
            Some(native) => f(native),
            None => Err(self.released("use")),
        }
    }

    fn released(&self, operation: &str) -> Error {
        Error::usage(
            ResultCode::InvalidEvent,
            format!("{operation} of released event {}", self.id()),
        )
    }

    fn driver(&self) -> &D {
        self.inner.queue.device().driver()
    }

    /// Fails with `InvalidEvent` once the event was released.
    pub fn ensure_live(&self) -> Result<()> {
        if self.inner.ref_count.is_released() {
            return Err(self.released("use"));
        }
        Ok(())
    }

    /// Handle identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Command that produced this event.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    /// Owning queue.
    pub fn queue(&self) -> &Queue<D> {
        &self.inner.queue
    }

    /// Owning context.
    pub fn context(&self) -> &Context<D> {
        self.inner.queue.context()
    }

    /// Native stream the command ran on.
    pub fn stream(&self) -> D::Stream {
        self.inner.stream
    }

    /// Slot of that stream within the queue.
    #[must_use]
    pub fn slot(&self) -> StreamId {
        self.inner.slot
    }

    /// Submission token of the command on its queue.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.inner.token
    }

    /// Per-queue sequence number, assigned when recorded.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self.inner.seq.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> EventState {
        EventState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.get()
    }
}

impl<D: Driver> Clone for EventHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> PartialEq for EventHandle<D> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<D: Driver> fmt::Debug for EventHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("queue", &self.inner.queue.id())
            .field("slot", &self.inner.slot)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// An event that is not handed to the caller yet.
///
/// Dropping it without [`publish`](PendingEvent::publish) releases the
/// event, so a failed enqueue never leaks a half-initialised handle.
pub(crate) struct PendingEvent<D: Driver> {
    handle: EventHandle<D>,
    armed: bool,
}

impl<D: Driver> PendingEvent<D> {
    pub(crate) fn new(handle: EventHandle<D>) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    pub(crate) fn handle(&self) -> &EventHandle<D> {
        &self.handle
    }

    pub(crate) fn publish(mut self) -> EventHandle<D> {
        self.armed = false;
        self.handle.clone()
    }
}

impl<D: Driver> Drop for PendingEvent<D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.handle.release() {
            tracing::warn!(
                backend = D::NAME,
                event = %self.handle.id(),
                error = %err,
                "Failed to release unpublished event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_state_from_raw() {
        for state in [
            EventState::NotStarted,
            EventState::Started,
            EventState::Recorded,
        ] {
            assert_eq!(EventState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_command_kind_abi_values() {
        assert_eq!(CommandKind::KernelLaunch as u32, 0);
        assert_eq!(CommandKind::MemBufferWrite as u32, 4);
        assert_eq!(CommandKind::EnqueueNative as u32, 7);
    }

    #[test]
    fn test_event_status_abi_values() {
        assert_eq!(EventStatus::Complete as u32, 0);
        assert_eq!(EventStatus::Running as u32, 1);
        assert_eq!(EventStatus::Submitted as u32, 2);
        assert_eq!(EventStatus::Queued as u32, 3);
    }
}
