//! Adapter-side command submission and event synchronization.
//!
//! `unirt-core` implements one uniform command-queue/event API over any
//! native accelerator backend that implements [`Driver`]. It owns the parts
//! every backend adapter needs and none should reimplement:
//!
//! - [`error`]: the unified [`ResultCode`] space and native status translation
//! - [`guard`]: scoped binding of a device's native context
//! - [`stream`]: stream selection with device-side cross-stream dependencies
//! - [`event`]: reference-counted completion events with a checked lifecycle
//! - [`enqueue`]: command entry points, including native-escape commands
//! - [`api`]: the ABI-shaped boundary reporting a [`ResultCode`] per call
//!
//! # Example
//!
//! ```ignore
//! use unirt_core::prelude::*;
//!
//! let device = Device::new(driver, 0)?;
//! let context = Context::new(&device)?;
//! let queue = Queue::new(&context, &device, QueueConfig::out_of_order())?;
//!
//! let first = queue
//!     .enqueue_native_command(|q, _: &mut ()| submit(q.native_handle()), &mut (), None, WaitList::empty(), true)?
//!     .expect("event requested");
//! let deps = [first];
//! queue.enqueue_events_wait(WaitList::from(&deps[..]), false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod api;
pub mod config;
pub mod device;
pub mod driver;
pub mod enqueue;
pub mod error;
pub mod event;
pub mod guard;
pub mod handle;
pub mod info;
pub mod logging;
pub mod memory;
pub mod queue;
pub mod stream;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use device::{Context, Device};
pub use driver::{Driver, EventFlags, HostFn};
pub use enqueue::NativeCommandProperties;
pub use error::{
    adapter_get_last_error, boundary, translate, AdapterError, Error, NativeResultExt,
    NativeStatus, Result, ResultCode,
};
pub use event::{CommandKind, EventHandle, EventState, EventStatus};
pub use guard::ScopedContext;
pub use handle::{HandleId, RefCount};
pub use info::{EventInfo, InfoWriter, ProfilingInfo};
pub use memory::Buffer;
pub use queue::{Queue, StreamId, StreamKind, StreamSelection};
pub use stream::{ScopedStream, WaitList};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{QueueConfig, QueueConfigBuilder};
    pub use crate::device::{Context, Device};
    pub use crate::driver::Driver;
    pub use crate::enqueue::NativeCommandProperties;
    pub use crate::error::{Error, NativeResultExt, Result, ResultCode};
    pub use crate::event::{CommandKind, EventHandle, EventStatus};
    pub use crate::info::{EventInfo, ProfilingInfo};
    pub use crate::memory::Buffer;
    pub use crate::queue::Queue;
    pub use crate::stream::WaitList;
}
