//! Host-thread implementation of [`Driver`].

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use unirt_core::{Driver, EventFlags, HostFn};

use crate::config::{ConfigError, HostConfig};
use crate::fault::{FaultInjector, HostOp};
use crate::status::HostStatus;
use crate::worker::StreamWorker;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<HostContext>> = const { Cell::new(None) };
}

/// Native context of a host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostContext {
    driver: u64,
    device: usize,
}

impl HostContext {
    /// Device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.device
    }
}

/// Native stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostStream {
    driver: u64,
    device: usize,
    id: u64,
}

impl HostStream {
    /// Device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Driver-unique stream number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Device allocation address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr {
    device: usize,
    id: u64,
}

#[derive(Debug, Default)]
struct EventSlot {
    /// Number of records issued.
    recorded: u64,
    /// Highest record generation that completed.
    completed: u64,
    /// Completion time of the last completed record, relative to the
    /// driver's epoch.
    timestamp_ns: Option<u64>,
}

#[derive(Debug, Default)]
struct EventShared {
    slot: Mutex<EventSlot>,
    signalled: Condvar,
}

impl EventShared {
    fn complete(&self, generation: u64, timestamp_ns: u64) {
        let mut slot = self.slot.lock();
        if slot.completed < generation {
            slot.completed = generation;
            slot.timestamp_ns = Some(timestamp_ns);
        }
        self.signalled.notify_all();
    }

    fn wait_for(&self, generation: u64) {
        let mut slot = self.slot.lock();
        while slot.completed < generation {
            self.signalled.wait(&mut slot);
        }
    }
}

/// Native event of the host backend.
#[derive(Debug)]
pub struct HostEvent {
    id: u64,
    device: usize,
    timing: bool,
    shared: Arc<EventShared>,
}

impl HostEvent {
    /// Driver-unique event number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times the event was recorded.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.shared.slot.lock().recorded
    }
}

struct StreamEntry {
    device: usize,
    worker: StreamWorker,
}

struct Allocation {
    device: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct Counters {
    streams_created: AtomicU64,
    streams_destroyed: AtomicU64,
    events_created: AtomicU64,
    events_destroyed: AtomicU64,
    waits_inserted: AtomicU64,
    host_fns_launched: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

/// Snapshot of driver activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Streams created.
    pub streams_created: u64,
    /// Streams destroyed.
    pub streams_destroyed: u64,
    /// Native events created.
    pub events_created: u64,
    /// Native events destroyed.
    pub events_destroyed: u64,
    /// Stream-wait-on-event edges inserted.
    pub waits_inserted: u64,
    /// Host functions launched.
    pub host_fns_launched: u64,
    /// Allocations made.
    pub allocations: u64,
    /// Allocations freed.
    pub frees: u64,
}

impl HostStats {
    /// Native events created and not destroyed.
    #[must_use]
    pub fn live_events(&self) -> u64 {
        self.events_created - self.events_destroyed
    }

    /// Streams created and not destroyed.
    #[must_use]
    pub fn live_streams(&self) -> u64 {
        self.streams_created - self.streams_destroyed
    }
}

/// A driver whose devices live in host memory and whose streams are
/// worker threads.
///
/// Work runs in submission order per stream; cross-stream waits block the
/// waiting stream's worker, never the submitting thread. Stream and event
/// calls fail with [`HostStatus::InvalidContext`] unless the owning
/// device's context is current on the calling thread.
pub struct HostDriver {
    id: u64,
    config: HostConfig,
    epoch: Instant,
    next_handle: AtomicU64,
    streams: Mutex<HashMap<u64, Arc<StreamEntry>>>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    faults: FaultInjector,
    counters: Counters,
}

impl HostDriver {
    /// Creates a driver from `config`.
    pub fn new(config: HostConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let driver = Self {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            epoch: Instant::now(),
            next_handle: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            faults: FaultInjector::default(),
            counters: Counters::default(),
        };
        tracing::info!(
            driver = driver.id,
            devices = driver.config.devices,
            max_streams = driver.config.max_streams_per_device,
            "Initialized host driver"
        );
        Ok(driver)
    }

    /// Creates a driver configured from `UNIRT_HOST_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(HostConfig::from_env()?)
    }

    /// Driver configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Fault injector consulted by every driver call.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> HostStats {
        let c = &self.counters;
        HostStats {
            streams_created: c.streams_created.load(Ordering::Acquire),
            streams_destroyed: c.streams_destroyed.load(Ordering::Acquire),
            events_created: c.events_created.load(Ordering::Acquire),
            events_destroyed: c.events_destroyed.load(Ordering::Acquire),
            waits_inserted: c.waits_inserted.load(Ordering::Acquire),
            host_fns_launched: c.host_fns_launched.load(Ordering::Acquire),
            allocations: c.allocations.load(Ordering::Acquire),
            frees: c.frees.load(Ordering::Acquire),
        }
    }

    /// Jobs submitted to `stream` that have not completed.
    pub fn stream_in_flight(&self, stream: HostStream) -> Result<u64, HostStatus> {
        Ok(self.lookup_stream(stream)?.worker.timeline().in_flight())
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// The current context, if it belongs to this driver.
    fn current(&self) -> Result<HostContext, HostStatus> {
        match CURRENT_CONTEXT.with(Cell::get) {
            Some(context) if context.driver == self.id => Ok(context),
            _ => Err(HostStatus::InvalidContext),
        }
    }

    fn require_device(&self, device: usize) -> Result<(), HostStatus> {
        if self.current()?.device != device {
            return Err(HostStatus::InvalidContext);
        }
        Ok(())
    }

    fn lookup_stream(&self, stream: HostStream) -> Result<Arc<StreamEntry>, HostStatus> {
        if stream.driver != self.id {
            return Err(HostStatus::InvalidHandle);
        }
        self.streams
            .lock()
            .get(&stream.id)
            .cloned()
            .ok_or(HostStatus::InvalidHandle)
    }

    /// Looks up `stream` and checks its device's context is current.
    fn stream_entry(&self, stream: HostStream) -> Result<Arc<StreamEntry>, HostStatus> {
        let entry = self.lookup_stream(stream)?;
        self.require_device(entry.device)?;
        Ok(entry)
    }

    fn allocation(
        &self,
        ptr: HostPtr,
        offset: usize,
        len: usize,
    ) -> Result<Arc<Mutex<Vec<u8>>>, HostStatus> {
        let allocations = self.allocations.lock();
        let allocation = allocations.get(&ptr.id).ok_or(HostStatus::InvalidHandle)?;
        let end = offset.checked_add(len).ok_or(HostStatus::InvalidValue)?;
        if end > allocation.data.lock().len() {
            return Err(HostStatus::InvalidValue);
        }
        Ok(Arc::clone(&allocation.data))
    }

    fn device_memory_in_use(&self, device: usize) -> usize {
        self.allocations
            .lock()
            .values()
            .filter(|a| a.device == device)
            .map(|a| a.data.lock().len())
            .sum()
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        for entry in self.streams.get_mut().values() {
            entry.worker.close();
        }
    }
}

impl Driver for HostDriver {
    const NAME: &'static str = "host";

    type Status = HostStatus;
    type Context = HostContext;
    type Stream = HostStream;
    type Event = HostEvent;
    type DevicePtr = HostPtr;

    fn device_count(&self) -> Result<usize, HostStatus> {
        Ok(self.config.devices)
    }

    fn device_context(&self, ordinal: usize) -> Result<HostContext, HostStatus> {
        if ordinal >= self.config.devices {
            return Err(HostStatus::InvalidValue);
        }
        Ok(HostContext {
            driver: self.id,
            device: ordinal,
        })
    }

    fn device_name(&self, ordinal: usize) -> Result<String, HostStatus> {
        if ordinal >= self.config.devices {
            return Err(HostStatus::InvalidValue);
        }
        Ok(format!("{} {ordinal}", self.config.name_prefix))
    }

    fn current_context(&self) -> Result<Option<HostContext>, HostStatus> {
        self.faults.check(HostOp::CurrentContext)?;
        Ok(CURRENT_CONTEXT.with(Cell::get))
    }

    fn set_current_context(&self, context: Option<HostContext>) -> Result<(), HostStatus> {
        self.faults.check(HostOp::SetCurrentContext)?;
        if let Some(context) = context {
            if context.driver == self.id && context.device >= self.config.devices {
                return Err(HostStatus::InvalidContext);
            }
        }
        CURRENT_CONTEXT.with(|current| current.set(context));
        Ok(())
    }

    fn stream_create(&self) -> Result<HostStream, HostStatus> {
        self.faults.check(HostOp::StreamCreate)?;
        let device = self.current()?.device;

        let mut streams = self.streams.lock();
        let live = streams.values().filter(|s| s.device == device).count();
        if live >= self.config.max_streams_per_device {
            return Err(HostStatus::OutOfResources);
        }

        let id = self.next_handle();
        let worker = StreamWorker::spawn(format!("unirt-host-d{device}-s{id}"))?;
        streams.insert(id, Arc::new(StreamEntry { device, worker }));
        self.counters.streams_created.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(driver = self.id, device, stream = id, "Created host stream");
        Ok(HostStream {
            driver: self.id,
            device,
            id,
        })
    }

    fn stream_destroy(&self, stream: HostStream) -> Result<(), HostStatus> {
        self.stream_entry(stream)?;
        let entry = self
            .streams
            .lock()
            .remove(&stream.id)
            .ok_or(HostStatus::InvalidHandle)?;
        entry.worker.close();
        self.counters.streams_destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stream_synchronize(&self, stream: HostStream) -> Result<(), HostStatus> {
        self.faults.check(HostOp::StreamSynchronize)?;
        self.stream_entry(stream)?.worker.timeline().wait_drained();
        Ok(())
    }

    fn stream_wait_event(&self, stream: HostStream, event: &HostEvent) -> Result<(), HostStatus> {
        self.faults.check(HostOp::StreamWaitEvent)?;
        let entry = self.stream_entry(stream)?;

        let generation = event.shared.slot.lock().recorded;
        if generation == 0 {
            return Ok(());
        }
        let shared = Arc::clone(&event.shared);
        entry
            .worker
            .submit(Box::new(move || shared.wait_for(generation)))?;
        self.counters.waits_inserted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn event_create(&self, flags: EventFlags) -> Result<HostEvent, HostStatus> {
        self.faults.check(HostOp::EventCreate)?;
        let device = self.current()?.device;
        self.counters.events_created.fetch_add(1, Ordering::AcqRel);
        Ok(HostEvent {
            id: self.next_handle(),
            device,
            timing: flags.timing_enabled(),
            shared: Arc::new(EventShared::default()),
        })
    }

    fn event_record(&self, event: &HostEvent, stream: HostStream) -> Result<(), HostStatus> {
        self.faults.check(HostOp::EventRecord)?;
        let entry = self.stream_entry(stream)?;
        if entry.device != event.device {
            return Err(HostStatus::InvalidHandle);
        }

        let generation = {
            let mut slot = event.shared.slot.lock();
            slot.recorded += 1;
            slot.recorded
        };
        let shared = Arc::clone(&event.shared);
        let epoch = self.epoch;
        entry.worker.submit(Box::new(move || {
            let now = u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
            shared.complete(generation, now);
        }))
    }

    fn event_query(&self, event: &HostEvent) -> Result<bool, HostStatus> {
        self.faults.check(HostOp::EventQuery)?;
        self.require_device(event.device)?;
        let slot = event.shared.slot.lock();
        Ok(slot.completed >= slot.recorded)
    }

    fn event_synchronize(&self, event: &HostEvent) -> Result<(), HostStatus> {
        self.faults.check(HostOp::EventSynchronize)?;
        self.require_device(event.device)?;
        let generation = event.shared.slot.lock().recorded;
        event.shared.wait_for(generation);
        Ok(())
    }

    fn event_elapsed_ns(&self, start: &HostEvent, end: &HostEvent) -> Result<u64, HostStatus> {
        self.require_device(end.device)?;
        if !start.timing || !end.timing {
            return Err(HostStatus::InvalidHandle);
        }
        let timestamp = |event: &HostEvent| {
            let slot = event.shared.slot.lock();
            match slot.timestamp_ns {
                Some(ts) if slot.completed >= slot.recorded => Ok(ts),
                _ => Err(HostStatus::NotReady),
            }
        };
        let start_ns = timestamp(start)?;
        let end_ns = timestamp(end)?;
        Ok(end_ns.saturating_sub(start_ns))
    }

    fn event_destroy(&self, event: HostEvent) -> Result<(), HostStatus> {
        self.faults.check(HostOp::EventDestroy)?;
        self.require_device(event.device)?;
        self.counters.events_destroyed.fetch_add(1, Ordering::AcqRel);
        drop(event);
        Ok(())
    }

    fn launch_host_fn(&self, stream: HostStream, f: HostFn) -> Result<(), HostStatus> {
        self.faults.check(HostOp::LaunchHostFn)?;
        self.stream_entry(stream)?.worker.submit(f)?;
        self.counters.host_fns_launched.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn mem_alloc(&self, size: usize) -> Result<HostPtr, HostStatus> {
        self.faults.check(HostOp::MemAlloc)?;
        let device = self.current()?.device;
        if size == 0 {
            return Err(HostStatus::InvalidValue);
        }
        let in_use = self.device_memory_in_use(device);
        if in_use.saturating_add(size) > self.config.memory_per_device {
            return Err(HostStatus::OutOfMemory);
        }

        let id = self.next_handle();
        self.allocations.lock().insert(
            id,
            Allocation {
                device,
                data: Arc::new(Mutex::new(vec![0; size])),
            },
        );
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(HostPtr { device, id })
    }

    fn mem_free(&self, ptr: HostPtr) -> Result<(), HostStatus> {
        self.require_device(ptr.device)?;
        self.allocations
            .lock()
            .remove(&ptr.id)
            .ok_or(HostStatus::InvalidHandle)?;
        self.counters.frees.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn memcpy_htod_async(
        &self,
        stream: HostStream,
        dst: HostPtr,
        offset: usize,
        src: Vec<u8>,
    ) -> Result<(), HostStatus> {
        self.faults.check(HostOp::Memcpy)?;
        let entry = self.stream_entry(stream)?;
        let data = self.allocation(dst, offset, src.len())?;
        entry.worker.submit(Box::new(move || {
            data.lock()[offset..offset + src.len()].copy_from_slice(&src);
        }))
    }

    fn memcpy_dtoh(
        &self,
        stream: HostStream,
        src: HostPtr,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), HostStatus> {
        self.faults.check(HostOp::Memcpy)?;
        let entry = self.stream_entry(stream)?;
        let data = self.allocation(src, offset, dst.len())?;
        entry.worker.timeline().wait_drained();
        let len = dst.len();
        dst.copy_from_slice(&data.lock()[offset..offset + len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn driver() -> HostDriver {
        HostDriver::new(HostConfig::with_devices(2)).unwrap()
    }

    fn bind(driver: &HostDriver, device: usize) {
        let context = driver.device_context(device).unwrap();
        driver.set_current_context(Some(context)).unwrap();
    }

    #[test]
    fn test_stream_ops_need_current_context() {
        let driver = driver();
        driver.set_current_context(None).unwrap();
        assert_eq!(driver.stream_create(), Err(HostStatus::InvalidContext));

        bind(&driver, 0);
        let stream = driver.stream_create().unwrap();
        bind(&driver, 1);
        assert_eq!(
            driver.stream_synchronize(stream),
            Err(HostStatus::InvalidContext)
        );

        bind(&driver, 0);
        driver.stream_destroy(stream).unwrap();
        assert_eq!(driver.stats().live_streams(), 0);
    }

    #[test]
    fn test_unrecorded_event_is_complete() {
        let driver = driver();
        bind(&driver, 0);
        let event = driver.event_create(EventFlags::DisableTiming).unwrap();
        assert_eq!(driver.event_query(&event), Ok(true));
        driver.event_destroy(event).unwrap();
    }

    #[test]
    fn test_cross_stream_wait_blocks_only_the_stream() {
        let driver = driver();
        bind(&driver, 0);
        let a = driver.stream_create().unwrap();
        let b = driver.stream_create().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        driver
            .launch_host_fn(
                a,
                Box::new(move || {
                    let _ = release_rx.recv();
                }),
            )
            .unwrap();
        let event = driver.event_create(EventFlags::DisableTiming).unwrap();
        driver.event_record(&event, a).unwrap();
        driver.stream_wait_event(b, &event).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        driver
            .launch_host_fn(b, Box::new(move || log.lock().push("b")))
            .unwrap();

        // The host is not blocked, and b has not run past the wait.
        assert_eq!(driver.event_query(&event), Ok(false));
        std::thread::sleep(Duration::from_millis(20));
        assert!(order.lock().is_empty());

        order.lock().push("a");
        release_tx.send(()).unwrap();
        driver.stream_synchronize(b).unwrap();
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(driver.stats().waits_inserted, 1);

        driver.event_destroy(event).unwrap();
        driver.stream_destroy(a).unwrap();
        driver.stream_destroy(b).unwrap();
    }

    #[test]
    fn test_elapsed_needs_timing_events() {
        let driver = driver();
        bind(&driver, 0);
        let stream = driver.stream_create().unwrap();
        let start = driver.event_create(EventFlags::Default).unwrap();
        let end = driver.event_create(EventFlags::Default).unwrap();
        let untimed = driver.event_create(EventFlags::DisableTiming).unwrap();

        assert_eq!(
            driver.event_elapsed_ns(&start, &end),
            Err(HostStatus::NotReady)
        );
        driver.event_record(&start, stream).unwrap();
        driver.event_record(&end, stream).unwrap();
        driver.event_record(&untimed, stream).unwrap();
        driver.event_synchronize(&end).unwrap();
        driver.event_synchronize(&untimed).unwrap();

        assert!(driver.event_elapsed_ns(&start, &end).is_ok());
        assert_eq!(
            driver.event_elapsed_ns(&start, &untimed),
            Err(HostStatus::InvalidHandle)
        );

        for event in [start, end, untimed] {
            driver.event_destroy(event).unwrap();
        }
        driver.stream_destroy(stream).unwrap();
    }

    #[test]
    fn test_memory_copies_are_stream_ordered() {
        let driver = driver();
        bind(&driver, 0);
        let stream = driver.stream_create().unwrap();
        let ptr = driver.mem_alloc(8).unwrap();

        driver
            .memcpy_htod_async(stream, ptr, 2, vec![1, 2, 3])
            .unwrap();
        let mut out = [0u8; 8];
        driver.memcpy_dtoh(stream, ptr, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);

        assert_eq!(
            driver.memcpy_htod_async(stream, ptr, 6, vec![0; 4]),
            Err(HostStatus::InvalidValue)
        );
        driver.mem_free(ptr).unwrap();
        assert_eq!(driver.mem_free(ptr), Err(HostStatus::InvalidHandle));
        driver.stream_destroy(stream).unwrap();
    }

    #[test]
    fn test_memory_limit() {
        let config = HostConfig {
            memory_per_device: 16,
            ..HostConfig::default()
        };
        let driver = HostDriver::new(config).unwrap();
        bind(&driver, 0);
        let ptr = driver.mem_alloc(12).unwrap();
        assert_eq!(driver.mem_alloc(8), Err(HostStatus::OutOfMemory));
        driver.mem_free(ptr).unwrap();
    }

    #[test]
    fn test_stream_limit() {
        let config = HostConfig {
            max_streams_per_device: 1,
            ..HostConfig::default()
        };
        let driver = HostDriver::new(config).unwrap();
        bind(&driver, 0);
        let stream = driver.stream_create().unwrap();
        assert_eq!(driver.stream_create(), Err(HostStatus::OutOfResources));
        driver.stream_destroy(stream).unwrap();
    }
}
