//! Shared fixture for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use unirt::host::{HostConfig, HostDriver, HostStats};
use unirt::prelude::*;

/// A host device with one context and one queue.
pub struct Fixture {
    pub driver: Arc<HostDriver>,
    pub device: Device<HostDriver>,
    pub context: Context<HostDriver>,
    pub queue: Queue<HostDriver>,
}

impl Fixture {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_host(HostConfig::default(), config)
    }

    pub fn with_host(host: HostConfig, config: QueueConfig) -> Self {
        let _ = unirt::logging::try_init_tracing("warn");
        let (driver, device) = unirt::open_host(host).expect("Failed to open host backend");
        let context = Context::new(&device).expect("Failed to create context");
        let queue = Queue::new(&context, &device, config).expect("Failed to create queue");
        Self {
            driver,
            device,
            context,
            queue,
        }
    }

    pub fn stats(&self) -> HostStats {
        self.driver.stats()
    }

    /// Native events alive on the driver, excluding the queue's own.
    pub fn live_events(&self) -> u64 {
        let base = u64::from(self.queue.config().enable_profiling);
        self.stats().live_events() - base
    }

    pub fn teardown(self) {
        self.queue.release().expect("Failed to release queue");
        self.context.release().expect("Failed to release context");
        assert_eq!(self.driver.stats().live_events(), 0);
        assert_eq!(self.driver.stats().live_streams(), 0);
    }
}

/// Enqueues a native command whose host work runs `f` on the selected stream.
pub fn enqueue_host_work<F>(
    queue: &Queue<HostDriver>,
    wait_list: &[EventHandle<HostDriver>],
    f: F,
) -> EventHandle<HostDriver>
where
    F: FnOnce() + Send + 'static,
{
    queue
        .enqueue_native_command(
            |queue, _: &mut ()| {
                let stream = queue.native_handle().expect("Failed to get native handle");
                queue.device().driver().launch_host_fn(stream, Box::new(f))
            },
            &mut (),
            None,
            WaitList::from(wait_list),
            true,
        )
        .expect("Failed to enqueue native command")
        .expect("event requested")
}
