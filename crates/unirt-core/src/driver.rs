//! Native backend seam.
//!
//! A [`Driver`] exposes the handful of native primitives the adapter layer is
//! built on: per-device execution contexts with a thread-local "current"
//! binding, ordered execution streams, completion events, host callbacks and
//! device memory copies. Every call reports failures in the backend's own
//! status type; the adapter translates them at its boundary.

use std::fmt;

use crate::error::NativeStatus;

/// Work a backend runs on one of its streams.
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

/// Flags for native event creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlags {
    /// Event records timestamps.
    Default,
    /// Event without timing support (cheaper).
    DisableTiming,
}

impl EventFlags {
    /// Whether events created with these flags can be timed.
    #[must_use]
    pub fn timing_enabled(self) -> bool {
        self == EventFlags::Default
    }
}

/// Native accelerator backend.
///
/// Stream, event and memory calls operate in the native context that is
/// current on the calling thread. Callers bind the right context first
/// (see [`ScopedContext`](crate::guard::ScopedContext)).
pub trait Driver: Send + Sync + Sized + 'static {
    /// Backend name used in logs and translated errors.
    const NAME: &'static str;

    /// Native status code.
    type Status: NativeStatus;
    /// Native context handle.
    type Context: Copy + Eq + fmt::Debug + Send + Sync;
    /// Native stream handle.
    type Stream: Copy + Eq + fmt::Debug + Send + Sync;
    /// Native completion primitive.
    type Event: fmt::Debug + Send + Sync;
    /// Device memory address.
    type DevicePtr: Copy + fmt::Debug + Send + Sync;

    /// Number of devices visible through this driver.
    fn device_count(&self) -> Result<usize, Self::Status>;

    /// Native context owned by the device at `ordinal`.
    fn device_context(&self, ordinal: usize) -> Result<Self::Context, Self::Status>;

    /// Human readable device name.
    fn device_name(&self, ordinal: usize) -> Result<String, Self::Status>;

    /// Context currently bound to the calling thread.
    fn current_context(&self) -> Result<Option<Self::Context>, Self::Status>;

    /// Binds `context` to the calling thread (`None` unbinds).
    fn set_current_context(&self, context: Option<Self::Context>) -> Result<(), Self::Status>;

    /// Creates a stream in the current context.
    fn stream_create(&self) -> Result<Self::Stream, Self::Status>;

    /// Destroys a stream. Work already submitted still completes.
    fn stream_destroy(&self, stream: Self::Stream) -> Result<(), Self::Status>;

    /// Blocks the host until all work submitted to `stream` has completed.
    fn stream_synchronize(&self, stream: Self::Stream) -> Result<(), Self::Status>;

    /// Makes all future work on `stream` wait for the most recent record of
    /// `event`, on the device, without blocking the host.
    fn stream_wait_event(&self, stream: Self::Stream, event: &Self::Event)
        -> Result<(), Self::Status>;

    /// Creates an unrecorded event.
    fn event_create(&self, flags: EventFlags) -> Result<Self::Event, Self::Status>;

    /// Records `event` at the current tail of `stream`.
    fn event_record(&self, event: &Self::Event, stream: Self::Stream) -> Result<(), Self::Status>;

    /// Returns whether all work captured by the last record has completed.
    fn event_query(&self, event: &Self::Event) -> Result<bool, Self::Status>;

    /// Blocks the host until the work captured by the last record completes.
    fn event_synchronize(&self, event: &Self::Event) -> Result<(), Self::Status>;

    /// Nanoseconds elapsed between two completed, timing-enabled events.
    fn event_elapsed_ns(&self, start: &Self::Event, end: &Self::Event)
        -> Result<u64, Self::Status>;

    /// Destroys an event.
    fn event_destroy(&self, event: Self::Event) -> Result<(), Self::Status>;

    /// Runs `f` on the device timeline of `stream`, after prior work.
    fn launch_host_fn(&self, stream: Self::Stream, f: HostFn) -> Result<(), Self::Status>;

    /// Allocates `size` bytes of device memory.
    fn mem_alloc(&self, size: usize) -> Result<Self::DevicePtr, Self::Status>;

    /// Frees device memory.
    fn mem_free(&self, ptr: Self::DevicePtr) -> Result<(), Self::Status>;

    /// Copies `src` to `dst + offset`, ordered on `stream`.
    ///
    /// The source is consumed by the call; the copy may complete later.
    fn memcpy_htod_async(
        &self,
        stream: Self::Stream,
        dst: Self::DevicePtr,
        offset: usize,
        src: Vec<u8>,
    ) -> Result<(), Self::Status>;

    /// Copies `src + offset` into `dst` after all prior work on `stream`,
    /// returning once the copy is complete.
    fn memcpy_dtoh(
        &self,
        stream: Self::Stream,
        src: Self::DevicePtr,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), Self::Status>;
}
