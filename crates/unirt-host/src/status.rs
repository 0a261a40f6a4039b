//! Native status codes of the host backend.

use unirt_core::{NativeStatus, ResultCode};

/// Failure reported by a [`HostDriver`](crate::HostDriver) call.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum HostStatus {
    /// An argument is out of range.
    #[error("HOST_ERROR_INVALID_VALUE")]
    InvalidValue = 1,
    /// No context, or a context of another device, is current.
    #[error("HOST_ERROR_INVALID_CONTEXT")]
    InvalidContext = 2,
    /// Unknown or destroyed stream, event or allocation.
    #[error("HOST_ERROR_INVALID_HANDLE")]
    InvalidHandle = 3,
    /// The device memory limit was reached.
    #[error("HOST_ERROR_OUT_OF_MEMORY")]
    OutOfMemory = 4,
    /// Stream limit reached or a worker thread could not be spawned.
    #[error("HOST_ERROR_OUT_OF_RESOURCES")]
    OutOfResources = 5,
    /// The work an event captures has not completed.
    #[error("HOST_ERROR_NOT_READY")]
    NotReady = 6,
    /// The device stopped processing work.
    #[error("HOST_ERROR_DEVICE_LOST")]
    DeviceLost = 7,
    /// The operation is not supported.
    #[error("HOST_ERROR_NOT_SUPPORTED")]
    NotSupported = 8,
    /// The driver was not initialized.
    #[error("HOST_ERROR_NOT_INITIALIZED")]
    NotInitialized = 9,
    /// Generic failure.
    #[error("HOST_ERROR_UNKNOWN")]
    Unknown = 999,
}

impl NativeStatus for HostStatus {
    fn raw(&self) -> i64 {
        *self as i64
    }

    fn to_result_code(&self) -> ResultCode {
        match self {
            HostStatus::InvalidValue => ResultCode::InvalidValue,
            HostStatus::InvalidContext => ResultCode::InvalidContext,
            HostStatus::InvalidHandle => ResultCode::InvalidValue,
            HostStatus::OutOfMemory => ResultCode::OutOfDeviceMemory,
            HostStatus::OutOfResources => ResultCode::OutOfResources,
            HostStatus::NotReady => ResultCode::InvalidOperation,
            HostStatus::DeviceLost => ResultCode::DeviceLost,
            HostStatus::NotSupported => ResultCode::UnsupportedFeature,
            HostStatus::NotInitialized => ResultCode::Uninitialized,
            HostStatus::Unknown => ResultCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_translation() {
        assert_eq!(
            HostStatus::OutOfMemory.to_result_code(),
            ResultCode::OutOfDeviceMemory
        );
        assert_eq!(
            HostStatus::InvalidContext.to_result_code(),
            ResultCode::InvalidContext
        );
        assert_eq!(HostStatus::Unknown.to_result_code(), ResultCode::Unknown);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HostStatus::NotReady.to_string(), "HOST_ERROR_NOT_READY");
        assert_eq!(HostStatus::DeviceLost.raw(), 7);
    }
}
