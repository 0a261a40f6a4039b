//! # unirt
//!
//! One command-queue/event API over mutually incompatible accelerator
//! backends.
//!
//! Callers submit commands to a [`Queue`]. Each command may depend on prior
//! commands through a wait-list of [`EventHandle`]s and may produce an event
//! of its own. Dependencies are enforced on the device: a command whose
//! wait-list spans several native streams gets device-side waits on its
//! stream and never blocks the submitting thread.
//!
//! ## Backends
//!
//! - **host**: worker-thread streams, always available ([`host`])
//! - **CUDA**: NVIDIA GPUs through the driver API (requires the `cuda`
//!   feature, [`cuda`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  enqueue_*  /  event_*  boundary (ResultCode per call)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  ScopedContext ─► ScopedStream ─► EventHandle            │
//! │  (bind context)   (pick stream,   (start / record,       │
//! │                    wait edges)     query, release)       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Driver: contexts, streams, events, host fns, memcpy     │
//! ├────────────────────────────┬─────────────────────────────┤
//! │  HostDriver (threads)      │  CudaDriver (cudarc)        │
//! └────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use unirt::prelude::*;
//!
//! let (driver, device) = unirt::open_host(HostConfig::default())?;
//! let context = Context::new(&device)?;
//! let queue = Queue::new(&context, &device, QueueConfig::out_of_order())?;
//!
//! let event = queue
//!     .enqueue_native_command(
//!         |queue, _: &mut ()| {
//!             let stream = queue.native_handle().expect("live queue");
//!             queue.device().driver().launch_host_fn(stream, Box::new(|| {}))
//!         },
//!         &mut (),
//!         None,
//!         WaitList::empty(),
//!         true,
//!     )?
//!     .expect("event requested");
//! event.wait()?;
//! event.release()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

// Re-export core types
pub use unirt_core::*;

/// Host-thread backend.
pub use unirt_host as host;

/// CUDA backend.
pub use unirt_cuda as cuda;

pub use unirt_host::{HostConfig, HostDriver};

/// Opens a host driver with `config` and its first device.
pub fn open_host(config: HostConfig) -> Result<(Arc<HostDriver>, Device<HostDriver>)> {
    let driver = HostDriver::new(config)
        .map_err(|err| Error::usage(ResultCode::InvalidValue, err.to_string()))?;
    let driver = Arc::new(driver);
    let device = Device::new(Arc::clone(&driver), 0)?;
    tracing::debug!(device = %device.name(), "Opened host backend");
    Ok((driver, device))
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use unirt_core::prelude::*;
    pub use unirt_host::{HostConfig, HostDriver};

    #[cfg(feature = "cuda")]
    pub use unirt_cuda::CudaDriver;
}
