//! Event info queries.
//!
//! Info queries use the two-call size protocol of the runtime ABI: a caller
//! first asks for the size (`value` absent, `size_ret` present), allocates,
//! then asks for the value. [`InfoWriter`] performs the argument checks and
//! the native-endian encoding shared by all selectors.

use crate::driver::Driver;
use crate::error::{Error, Result, ResultCode};
use crate::event::EventHandle;

/// Event info selector.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventInfo {
    /// Handle of the owning queue (8 bytes).
    CommandQueue = 0,
    /// Handle of the owning context (8 bytes).
    Context = 1,
    /// [`CommandKind`](crate::event::CommandKind) as `u32`.
    CommandType = 2,
    /// [`EventStatus`](crate::event::EventStatus) as `u32`.
    CommandExecutionStatus = 3,
    /// Reference count as `u32`.
    ReferenceCount = 4,
}

impl EventInfo {
    /// Every selector, in ABI order.
    pub const ALL: [EventInfo; 5] = [
        EventInfo::CommandQueue,
        EventInfo::Context,
        EventInfo::CommandType,
        EventInfo::CommandExecutionStatus,
        EventInfo::ReferenceCount,
    ];

    /// Size of the encoded value in bytes.
    #[must_use]
    pub fn value_size(self) -> usize {
        match self {
            EventInfo::CommandQueue | EventInfo::Context => std::mem::size_of::<u64>(),
            _ => std::mem::size_of::<u32>(),
        }
    }
}

impl TryFrom<u32> for EventInfo {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        EventInfo::ALL
            .into_iter()
            .find(|info| *info as u32 == raw)
            .ok_or_else(|| {
                Error::usage(
                    ResultCode::InvalidEnumeration,
                    format!("unknown event info selector {raw:#x}"),
                )
            })
    }
}

/// Event profiling selector. Every value is a `u64` nanosecond timestamp.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingInfo {
    /// The command was enqueued.
    CommandQueued = 0,
    /// The command was submitted to the device.
    CommandSubmit = 1,
    /// The command started executing.
    CommandStart = 2,
    /// The command finished executing.
    CommandEnd = 3,
    /// The command and its child commands finished.
    CommandComplete = 4,
}

impl TryFrom<u32> for ProfilingInfo {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(ProfilingInfo::CommandQueued),
            1 => Ok(ProfilingInfo::CommandSubmit),
            2 => Ok(ProfilingInfo::CommandStart),
            3 => Ok(ProfilingInfo::CommandEnd),
            4 => Ok(ProfilingInfo::CommandComplete),
            _ => Err(Error::usage(
                ResultCode::InvalidEnumeration,
                format!("unknown profiling info selector {raw:#x}"),
            )),
        }
    }
}

/// Output side of an info query.
#[derive(Debug)]
pub struct InfoWriter<'a> {
    size: usize,
    value: Option<&'a mut [u8]>,
    size_ret: Option<&'a mut usize>,
}

impl<'a> InfoWriter<'a> {
    /// Validates the output arguments of an info query.
    ///
    /// `size` is the capacity the caller claims for `value`.
    pub fn new(
        size: usize,
        value: Option<&'a mut [u8]>,
        size_ret: Option<&'a mut usize>,
    ) -> Result<Self> {
        match (&value, &size_ret) {
            (Some(_), _) if size == 0 => {
                return Err(Error::usage(
                    ResultCode::InvalidValue,
                    "value buffer given with a zero size",
                ))
            }
            (None, None) => {
                return Err(Error::usage(
                    ResultCode::InvalidValue,
                    "neither a value buffer nor a size output was given",
                ))
            }
            (None, Some(_)) if size != 0 => {
                return Err(Error::usage(
                    ResultCode::InvalidNullPointer,
                    format!("size {size} given without a value buffer"),
                ))
            }
            (Some(buffer), _) if buffer.len() < size => {
                return Err(Error::usage(
                    ResultCode::InvalidValue,
                    format!("value buffer holds {} bytes, size is {size}", buffer.len()),
                ))
            }
            _ => {}
        }
        Ok(Self {
            size,
            value,
            size_ret,
        })
    }

    /// Writes a `u32` value.
    pub fn write_u32(self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_ne_bytes())
    }

    /// Writes a `u64` value.
    pub fn write_u64(self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_ne_bytes())
    }

    /// Reports the size of `bytes` and copies them if a buffer was given.
    ///
    /// The size output is written even when the buffer is too small.
    pub fn write_bytes(self, bytes: &[u8]) -> Result<()> {
        if let Some(size_ret) = self.size_ret {
            *size_ret = bytes.len();
        }
        if let Some(value) = self.value {
            if self.size < bytes.len() {
                return Err(Error::usage(
                    ResultCode::InvalidSize,
                    format!("value needs {} bytes, size is {}", bytes.len(), self.size),
                ));
            }
            value[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }
}

impl<D: Driver> EventHandle<D> {
    /// Answers an info query for `info`.
    pub fn get_info(&self, info: EventInfo, writer: InfoWriter<'_>) -> Result<()> {
        self.ensure_live()?;
        match info {
            EventInfo::CommandQueue => writer.write_u64(self.queue().id().raw()),
            EventInfo::Context => writer.write_u64(self.context().id().raw()),
            EventInfo::CommandType => writer.write_u32(self.kind() as u32),
            EventInfo::CommandExecutionStatus => {
                writer.write_u32(self.execution_status()? as u32)
            }
            EventInfo::ReferenceCount => writer.write_u32(self.ref_count()),
        }
    }
}
