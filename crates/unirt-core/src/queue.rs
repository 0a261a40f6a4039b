//! Command queues and their native stream pools.
//!
//! A [`Queue`] owns a fixed pool of native streams created in its device's
//! context: one compute stream for in-order queues, several compute streams
//! plus an optional transfer stream for out-of-order queues. Commands are
//! handed a stream by the stream selector ([`ScopedStream`]); the queue only
//! keeps the bookkeeping needed to pick one.
//!
//! ```text
//! Queue (out-of-order)
//!   Compute[0]  [cmd 1][cmd 5]
//!   Compute[1]  [cmd 2]  ^ wait(cmd 4)
//!   Compute[2]  [cmd 3]  |
//!   Compute[3]  [cmd 4]--+
//!   Transfer    [write][read]
//! ```
//!
//! [`ScopedStream`]: crate::stream::ScopedStream

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::device::{Context, Device};
use crate::driver::{Driver, EventFlags};
use crate::error::{Error, NativeResultExt, Result, ResultCode};
use crate::event::EventHandle;
use crate::guard::ScopedContext;
use crate::handle::{HandleId, RefCount};

/// Stream slot within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Compute stream for kernels and generic commands.
    Compute(usize),
    /// Dedicated transfer stream for host-device copies.
    Transfer,
}

/// Class of stream a command should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Any compute stream.
    Compute,
    /// The transfer stream when the queue has one, otherwise compute.
    Transfer,
}

/// The stream chosen for one command.
pub struct StreamSelection<D: Driver> {
    stream: D::Stream,
    slot: StreamId,
    token: u64,
}

impl<D: Driver> StreamSelection<D> {
    /// Native stream.
    pub fn stream(&self) -> D::Stream {
        self.stream
    }

    /// Slot of the stream within its queue.
    #[must_use]
    pub fn slot(&self) -> StreamId {
        self.slot
    }

    /// Submission token; increases with every selection on the queue.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl<D: Driver> Clone for StreamSelection<D> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream,
            slot: self.slot,
            token: self.token,
        }
    }
}

impl<D: Driver> fmt::Debug for StreamSelection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSelection")
            .field("stream", &self.stream)
            .field("slot", &self.slot)
            .field("token", &self.token)
            .finish()
    }
}

/// Selection bookkeeping, guarded by the queue's pool lock.
#[derive(Debug)]
struct PoolState {
    /// Next compute stream for round-robin selection.
    round_robin: usize,
    /// Next submission token.
    next_token: u64,
    /// Token of the last command handed each compute stream.
    last_compute: Vec<u64>,
    /// Token of the last command handed the transfer stream.
    last_transfer: u64,
}

impl PoolState {
    fn last_token_mut(&mut self, slot: StreamId) -> Option<&mut u64> {
        match slot {
            StreamId::Compute(index) => self.last_compute.get_mut(index),
            StreamId::Transfer => Some(&mut self.last_transfer),
        }
    }
}

/// Native resources created for a queue.
struct QueueStreams<D: Driver> {
    compute: Vec<D::Stream>,
    transfer: Option<D::Stream>,
    profiling_base: Option<D::Event>,
}

/// An ordered submission point on one device within one context.
///
/// Cloning a `Queue` copies the handle; it does not add a reference.
/// Use [`retain`](Queue::retain) and [`release`](Queue::release).
pub struct Queue<D: Driver> {
    inner: Arc<QueueInner<D>>,
}

struct QueueInner<D: Driver> {
    id: HandleId,
    context: Context<D>,
    device: Device<D>,
    config: QueueConfig,
    compute: Vec<D::Stream>,
    transfer: Option<D::Stream>,
    pool: Mutex<PoolState>,
    /// Stream selected for the command being enqueued, per thread.
    interop: Mutex<HashMap<ThreadId, D::Stream>>,
    ref_count: RefCount,
    event_seq: AtomicU64,
    /// Event recorded at creation; profiling timestamps are relative to it.
    profiling_base: Mutex<Option<D::Event>>,
}

impl<D: Driver> Queue<D> {
    /// Creates a queue on `device` within `context`.
    pub fn new(context: &Context<D>, device: &Device<D>, config: QueueConfig) -> Result<Self> {
        context.ensure_live()?;
        if !context.device().same_device(device) {
            return Err(Error::usage(
                ResultCode::InvalidDevice,
                format!(
                    "device {} does not belong to context {}",
                    device.ordinal(),
                    context.id()
                ),
            ));
        }
        if config.effective_compute_streams() == 0 {
            return Err(Error::usage(
                ResultCode::InvalidValue,
                "queue needs at least one compute stream",
            ));
        }

        let _active = ScopedContext::new(device)?;
        context.retain()?;
        let streams = match Self::create_streams(device.driver(), &config) {
            Ok(streams) => streams,
            Err(err) => {
                // The reference taken above is the only one this call owns.
                if let Err(release_err) = context.release() {
                    tracing::warn!(
                        backend = D::NAME,
                        context = %context.id(),
                        error = %release_err,
                        "Failed to release context after queue creation failed"
                    );
                }
                return Err(err);
            }
        };

        let num_compute = streams.compute.len();
        let queue = Self {
            inner: Arc::new(QueueInner {
                id: HandleId::next(),
                context: context.clone(),
                device: device.clone(),
                pool: Mutex::new(PoolState {
                    round_robin: 0,
                    next_token: 1,
                    last_compute: vec![0; num_compute],
                    last_transfer: 0,
                }),
                compute: streams.compute,
                transfer: streams.transfer,
                interop: Mutex::new(HashMap::new()),
                ref_count: RefCount::new(),
                event_seq: AtomicU64::new(1),
                profiling_base: Mutex::new(streams.profiling_base),
                config,
            }),
        };

        tracing::info!(
            backend = D::NAME,
            queue = %queue.id(),
            device = device.ordinal(),
            num_compute,
            has_transfer = queue.inner.transfer.is_some(),
            in_order = queue.inner.config.in_order,
            profiling = queue.inner.config.enable_profiling,
            "Created queue"
        );

        Ok(queue)
    }

    /// Creates a queue with the default (in-order) configuration.
    pub fn with_defaults(context: &Context<D>, device: &Device<D>) -> Result<Self> {
        Self::new(context, device, QueueConfig::default())
    }

    fn create_streams(driver: &D, config: &QueueConfig) -> Result<QueueStreams<D>> {
        let mut compute = Vec::with_capacity(config.effective_compute_streams());
        for _ in 0..config.effective_compute_streams() {
            match driver.stream_create().native(D::NAME, "stream_create") {
                Ok(stream) => compute.push(stream),
                Err(err) => {
                    destroy_streams(driver, &compute);
                    return Err(err);
                }
            }
        }

        let transfer = if config.effective_transfer_stream() {
            match driver.stream_create().native(D::NAME, "stream_create") {
                Ok(stream) => Some(stream),
                Err(err) => {
                    destroy_streams(driver, &compute);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let profiling_base = if config.enable_profiling {
            match record_profiling_base(driver, compute[0]) {
                Ok(event) => Some(event),
                Err(err) => {
                    destroy_streams(driver, &compute);
                    destroy_streams(driver, transfer.as_slice());
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(QueueStreams {
            compute,
            transfer,
            profiling_base,
        })
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

    /// Owning device.
    pub fn device(&self) -> &Device<D> {
        &self.inner.device
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Compute streams of this queue.
    pub fn compute_streams(&self) -> &[D::Stream] {
        &self.inner.compute
    }

    /// Transfer stream, if the queue has one.
    pub fn transfer_stream(&self) -> Option<D::Stream> {
        self.inner.transfer
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.get()
    }

    /// Fails with `InvalidQueue` once the queue was released.
    pub fn ensure_live(&self) -> Result<()> {
        if self.inner.ref_count.is_released() {
            return Err(Error::usage(
                ResultCode::InvalidQueue,
                format!("queue {} was released", self.id()),
            ));
        }
        Ok(())
    }

    /// Adds a reference.
    pub fn retain(&self) -> Result<()> {
        if !self.inner.ref_count.retain() {
            return Err(Error::usage(
                ResultCode::InvalidQueue,
                format!("retain of released queue {}", self.id()),
            ));
        }
        Ok(())
    }

    /// Drops a reference, tearing down the native streams on the last one.
    ///
    /// Pending work is drained before the streams are destroyed.
    pub fn release(&self) -> Result<()> {
        match self.inner.ref_count.release() {
            Some(true) => self.teardown(),
            Some(false) => Ok(()),
            None => Err(Error::usage(
                ResultCode::InvalidQueue,
                format!("release of released queue {}", self.id()),
            )),
        }
    }

    fn teardown(&self) -> Result<()> {
        let driver = self.inner.device.driver();
        let active = ScopedContext::new(&self.inner.device);

        let mut result = active.as_ref().map(|_| ()).map_err(Clone::clone);
        for stream in self.all_streams() {
            let synced = driver
                .stream_synchronize(stream)
                .native(D::NAME, "stream_synchronize");
            let destroyed = driver
                .stream_destroy(stream)
                .native(D::NAME, "stream_destroy");
            result = result.and(synced).and(destroyed);
        }
        if let Some(base) = self.inner.profiling_base.lock().take() {
            result = result.and(driver.event_destroy(base).native(D::NAME, "event_destroy"));
        }
        drop(active);

        tracing::debug!(backend = D::NAME, queue = %self.id(), "Released queue");
        result.and(self.inner.context.release())
    }

    /// Blocks until all commands submitted to this queue have completed.
    pub fn finish(&self) -> Result<()> {
        self.ensure_live()?;
        let _active = ScopedContext::new(&self.inner.device)?;
        let driver = self.inner.device.driver();
        for stream in self.all_streams() {
            driver
                .stream_synchronize(stream)
                .native(D::NAME, "stream_synchronize")?;
        }
        Ok(())
    }

    /// Native stream external code should submit to.
    ///
    /// Inside a native-escape callback this is exactly the stream selected
    /// for that command. Elsewhere it is the compute stream the next
    /// command without dependencies would get; selection state is left
    /// untouched.
    pub fn native_handle(&self) -> Result<D::Stream> {
        self.ensure_live()?;
        if let Some(stream) = self.inner.interop.lock().get(&thread::current().id()) {
            return Ok(*stream);
        }
        let round_robin = self.inner.pool.lock().round_robin;
        Ok(self.stream_for(StreamId::Compute(round_robin)))
    }

    /// Streams in slot order, transfer last.
    pub(crate) fn all_streams(&self) -> impl Iterator<Item = D::Stream> + '_ {
        self.inner
            .compute
            .iter()
            .copied()
            .chain(self.inner.transfer)
    }

    /// Picks the stream for a new command.
    ///
    /// A wait-list entry from this queue that was the last command handed its
    /// stream lets the new command reuse that stream, making the dependency
    /// implicit. Otherwise the next stream is taken round-robin.
    pub(crate) fn select_stream(
        &self,
        kind: StreamKind,
        wait_list: &[EventHandle<D>],
    ) -> StreamSelection<D> {
        let mut pool = self.inner.pool.lock();

        let slot = match (kind, self.inner.transfer) {
            (StreamKind::Transfer, Some(_)) => StreamId::Transfer,
            _ => self
                .reusable_slot(&pool, wait_list)
                .unwrap_or_else(|| {
                    let index = pool.round_robin % self.inner.compute.len();
                    pool.round_robin = pool.round_robin.wrapping_add(1);
                    StreamId::Compute(index)
                }),
        };

        let token = pool.next_token;
        pool.next_token += 1;
        if let Some(last) = pool.last_token_mut(slot) {
            *last = token;
        }

        StreamSelection {
            stream: self.stream_for(slot),
            slot,
            token,
        }
    }

    fn reusable_slot(&self, pool: &PoolState, wait_list: &[EventHandle<D>]) -> Option<StreamId> {
        wait_list.iter().find_map(|event| {
            if event.queue().id() != self.id() {
                return None;
            }
            match event.slot() {
                StreamId::Compute(index)
                    if pool.last_compute.get(index) == Some(&event.token()) =>
                {
                    Some(StreamId::Compute(index))
                }
                _ => None,
            }
        })
    }

    fn stream_for(&self, slot: StreamId) -> D::Stream {
        match (slot, self.inner.transfer) {
            (StreamId::Transfer, Some(stream)) => stream,
            (StreamId::Compute(index), _) => self.inner.compute[index % self.inner.compute.len()],
            (StreamId::Transfer, None) => self.inner.compute[0],
        }
    }

    /// Publishes `stream` as this thread's interop stream, returning the
    /// previous one.
    pub(crate) fn publish_interop(&self, stream: D::Stream) -> Option<D::Stream> {
        self.inner
            .interop
            .lock()
            .insert(thread::current().id(), stream)
    }

    /// Restores the interop stream saved by [`publish_interop`](Self::publish_interop).
    pub(crate) fn restore_interop(&self, previous: Option<D::Stream>) {
        let mut interop = self.inner.interop.lock();
        let thread = thread::current().id();
        match previous {
            Some(stream) => {
                interop.insert(thread, stream);
            }
            None => {
                interop.remove(&thread);
            }
        }
    }

    /// Next event sequence number.
    pub(crate) fn next_event_seq(&self) -> u64 {
        self.inner.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `f` with the profiling base event, if profiling is enabled.
    pub(crate) fn with_profiling_base<R>(&self, f: impl FnOnce(&D::Event) -> R) -> Option<R> {
        self.inner.profiling_base.lock().as_ref().map(f)
    }
}

impl<D: Driver> Clone for Queue<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> PartialEq for Queue<D> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<D: Driver> fmt::Debug for Queue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context.id())
            .field("device", &self.inner.device.ordinal())
            .field("compute", &self.inner.compute)
            .field("transfer", &self.inner.transfer)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

fn destroy_streams<D: Driver>(driver: &D, streams: &[D::Stream]) {
    for &stream in streams {
        if let Err(status) = driver.stream_destroy(stream) {
            tracing::warn!(backend = D::NAME, %status, "Failed to destroy stream during cleanup");
        }
    }
}

fn record_profiling_base<D: Driver>(driver: &D, stream: D::Stream) -> Result<D::Event> {
    let event = driver
        .event_create(EventFlags::Default)
        .native(D::NAME, "event_create")?;
    let recorded = driver
        .event_record(&event, stream)
        .native(D::NAME, "event_record")
        .and_then(|()| {
            driver
                .event_synchronize(&event)
                .native(D::NAME, "event_synchronize")
        });
    match recorded {
        Ok(()) => Ok(event),
        Err(err) => {
            if let Err(status) = driver.event_destroy(event) {
                tracing::warn!(backend = D::NAME, %status, "Failed to destroy profiling base event");
            }
            Err(err)
        }
    }
}
