//! Host-thread backend for unirt.
//!
//! [`HostDriver`] implements [`unirt_core::Driver`] without any accelerator:
//! each device is a slice of host memory, each stream a worker thread that
//! runs submitted work in order, and each event a generation counter that
//! a stream advances when it reaches the record. Cross-stream waits park
//! the waiting worker, so ordering is enforced on the "device" exactly as a
//! GPU driver would, and the submitting thread never blocks.
//!
//! The driver also enforces the current-context discipline of real drivers
//! and exposes a [`FaultInjector`] and activity counters, which makes it the
//! backend the adapter layer is tested against.
//!
//! ```ignore
//! use std::sync::Arc;
//! use unirt_core::prelude::*;
//! use unirt_host::{HostConfig, HostDriver};
//!
//! let driver = Arc::new(HostDriver::new(HostConfig::default())?);
//! let device = Device::new(Arc::clone(&driver), 0)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod driver;
pub mod fault;
mod status;
mod worker;

pub use config::{ConfigError, HostConfig};
pub use driver::{HostContext, HostDriver, HostEvent, HostPtr, HostStats, HostStream};
pub use fault::{FaultInjector, HostOp};
pub use status::HostStatus;
