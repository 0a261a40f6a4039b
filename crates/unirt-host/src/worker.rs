//! Stream worker threads.
//!
//! Each host stream is a dedicated thread draining a job channel in
//! submission order. A [`Timeline`] counts submitted and completed jobs so
//! the host can wait for a stream to drain.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use unirt_core::HostFn;

use crate::status::HostStatus;

#[derive(Debug, Default)]
struct TimelineState {
    submitted: u64,
    completed: u64,
}

/// Submitted/completed job counters of one stream.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
    drained: Condvar,
}

impl Timeline {
    fn complete_one(&self) {
        let mut state = self.state.lock();
        state.completed += 1;
        self.drained.notify_all();
    }

    /// Blocks until every job submitted before the call completed.
    pub(crate) fn wait_drained(&self) {
        let mut state = self.state.lock();
        let target = state.submitted;
        while state.completed < target {
            self.drained.wait(&mut state);
        }
    }

    /// Number of jobs submitted but not completed.
    pub(crate) fn in_flight(&self) -> u64 {
        let state = self.state.lock();
        state.submitted - state.completed
    }
}

/// Handle to a running stream worker.
pub(crate) struct StreamWorker {
    sender: Mutex<Option<Sender<HostFn>>>,
    timeline: Arc<Timeline>,
}

impl StreamWorker {
    /// Spawns the worker thread.
    pub(crate) fn spawn(name: String) -> Result<Self, HostStatus> {
        let (sender, receiver) = mpsc::channel::<HostFn>();
        let timeline = Arc::new(Timeline::default());
        let worker_timeline = Arc::clone(&timeline);

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                for job in receiver {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_default();
                        tracing::warn!(%message, "Host function panicked on stream worker");
                    }
                    worker_timeline.complete_one();
                }
            })
            .map_err(|err| {
                tracing::warn!(error = %err, "Failed to spawn stream worker");
                HostStatus::OutOfResources
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            timeline,
        })
    }

    /// Appends `job` to the stream.
    pub(crate) fn submit(&self, job: HostFn) -> Result<(), HostStatus> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(HostStatus::InvalidHandle)?;
        self.timeline.state.lock().submitted += 1;
        sender.send(job).map_err(|_| {
            self.timeline.complete_one();
            HostStatus::DeviceLost
        })
    }

    /// Stream counters.
    pub(crate) fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Stops accepting work. Jobs already submitted still run.
    pub(crate) fn close(&self) {
        self.sender.lock().take();
    }
}
