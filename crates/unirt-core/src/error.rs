//! Unified result codes and native status translation.
//!
//! Every operation exposed at the runtime boundary reports exactly one
//! [`ResultCode`]. Inside the crate, failures travel as [`Error`], which keeps
//! the two error domains apart:
//!
//! - errors raised in unified terms (usage errors, internal-consistency
//!   violations) carry their [`ResultCode`] directly and propagate unchanged;
//! - failures reported by a native backend are routed through [`translate`],
//!   which maps the backend status onto the unified space and remembers the
//!   raw status as the thread's last adapter error.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Unified result code returned by every boundary operation.
///
/// The discriminants are part of the runtime ABI and never change.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation completed successfully.
    Success = 0,
    /// The operation is not valid in the object's current state.
    InvalidOperation = 1,
    /// Invalid queue handle or released queue.
    InvalidQueue = 2,
    /// An argument value is invalid.
    InvalidValue = 3,
    /// Invalid context, or the wrong native context is current.
    InvalidContext = 4,
    /// Invalid or released event.
    InvalidEvent = 5,
    /// Malformed wait-list or wait-list entry.
    InvalidEventWaitList = 6,
    /// Invalid device handle.
    InvalidDevice = 7,
    /// The device stopped responding.
    DeviceLost = 8,
    /// Host memory allocation failed.
    OutOfHostMemory = 9,
    /// Device memory allocation failed.
    OutOfDeviceMemory = 10,
    /// The backend ran out of some other resource.
    OutOfResources = 11,
    /// Profiling data is not available for this event.
    ProfilingInfoNotAvailable = 12,
    /// Invalid memory object.
    InvalidMemObject = 13,
    /// A required handle was null.
    InvalidNullHandle = 14,
    /// A required pointer was null.
    InvalidNullPointer = 15,
    /// A size argument does not fit the data.
    InvalidSize = 16,
    /// An enumeration value is out of range.
    InvalidEnumeration = 17,
    /// The backend does not support the requested feature.
    UnsupportedFeature = 18,
    /// The backend has not been initialized.
    Uninitialized = 19,
    /// Backend-specific failure; details through [`adapter_get_last_error`].
    AdapterSpecific = 20,
    /// Generic failure.
    Unknown = 0x7fff_fffe,
}

impl ResultCode {
    /// Every defined code, in discriminant order.
    pub const ALL: [ResultCode; 22] = [
        ResultCode::Success,
        ResultCode::InvalidOperation,
        ResultCode::InvalidQueue,
        ResultCode::InvalidValue,
        ResultCode::InvalidContext,
        ResultCode::InvalidEvent,
        ResultCode::InvalidEventWaitList,
        ResultCode::InvalidDevice,
        ResultCode::DeviceLost,
        ResultCode::OutOfHostMemory,
        ResultCode::OutOfDeviceMemory,
        ResultCode::OutOfResources,
        ResultCode::ProfilingInfoNotAvailable,
        ResultCode::InvalidMemObject,
        ResultCode::InvalidNullHandle,
        ResultCode::InvalidNullPointer,
        ResultCode::InvalidSize,
        ResultCode::InvalidEnumeration,
        ResultCode::UnsupportedFeature,
        ResultCode::Uninitialized,
        ResultCode::AdapterSpecific,
        ResultCode::Unknown,
    ];

    /// Returns true for [`ResultCode::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Raw ABI value.
    #[must_use]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Parses a raw ABI value.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_raw() == raw)
    }

    /// Converts a boundary result back into a `Result`.
    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::usage(self, "reported by boundary call"))
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::InvalidOperation => "ERROR_INVALID_OPERATION",
            ResultCode::InvalidQueue => "ERROR_INVALID_QUEUE",
            ResultCode::InvalidValue => "ERROR_INVALID_VALUE",
            ResultCode::InvalidContext => "ERROR_INVALID_CONTEXT",
            ResultCode::InvalidEvent => "ERROR_INVALID_EVENT",
            ResultCode::InvalidEventWaitList => "ERROR_INVALID_EVENT_WAIT_LIST",
            ResultCode::InvalidDevice => "ERROR_INVALID_DEVICE",
            ResultCode::DeviceLost => "ERROR_DEVICE_LOST",
            ResultCode::OutOfHostMemory => "ERROR_OUT_OF_HOST_MEMORY",
            ResultCode::OutOfDeviceMemory => "ERROR_OUT_OF_DEVICE_MEMORY",
            ResultCode::OutOfResources => "ERROR_OUT_OF_RESOURCES",
            ResultCode::ProfilingInfoNotAvailable => "ERROR_PROFILING_INFO_NOT_AVAILABLE",
            ResultCode::InvalidMemObject => "ERROR_INVALID_MEM_OBJECT",
            ResultCode::InvalidNullHandle => "ERROR_INVALID_NULL_HANDLE",
            ResultCode::InvalidNullPointer => "ERROR_INVALID_NULL_POINTER",
            ResultCode::InvalidSize => "ERROR_INVALID_SIZE",
            ResultCode::InvalidEnumeration => "ERROR_INVALID_ENUMERATION",
            ResultCode::UnsupportedFeature => "ERROR_UNSUPPORTED_FEATURE",
            ResultCode::Uninitialized => "ERROR_UNINITIALIZED",
            ResultCode::AdapterSpecific => "ERROR_ADAPTER_SPECIFIC",
            ResultCode::Unknown => "ERROR_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Errors raised inside the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Caller misuse detected before any native call.
    #[error("{code}: {message}")]
    Usage {
        /// Unified code reported to the caller.
        code: ResultCode,
        /// Human readable detail.
        message: String,
    },

    /// A native backend call failed.
    #[error("{backend} `{call}` failed with {detail} (native status {raw}), reported as {code}")]
    Native {
        /// Backend name.
        backend: &'static str,
        /// Native operation that failed.
        call: &'static str,
        /// Raw native status value.
        raw: i64,
        /// Native status rendered by the backend.
        detail: String,
        /// Translated unified code.
        code: ResultCode,
    },

    /// The adapter drove one of its own state machines out of order.
    #[error("internal consistency violation: {0}")]
    Internal(String),

    /// Caller-supplied native work panicked.
    #[error("native command panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Creates a usage error.
    pub fn usage(code: ResultCode, message: impl Into<String>) -> Self {
        Error::Usage {
            code,
            message: message.into(),
        }
    }

    /// Creates an internal-consistency error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Unified code for this error.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Usage { code, .. } | Error::Native { code, .. } => *code,
            Error::Internal(_) => ResultCode::InvalidOperation,
            Error::Panicked(_) => ResultCode::Unknown,
        }
    }

    /// Returns true if this error came from a native backend call.
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self, Error::Native { .. })
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A backend status code that can be translated into the unified space.
///
/// Implementations must be total: every status value, including ones the
/// backend adds after this crate was written, maps to some [`ResultCode`].
pub trait NativeStatus: Copy + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Raw numeric value as reported by the backend.
    fn raw(&self) -> i64;

    /// Unified image of this status.
    fn to_result_code(&self) -> ResultCode;
}

thread_local! {
    static LAST_ADAPTER_ERROR: RefCell<Option<AdapterError>> = const { RefCell::new(None) };
}

/// Detail of the most recent native failure seen on this thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    /// Backend that failed.
    pub backend: &'static str,
    /// Human readable description.
    pub message: String,
    /// Raw native status.
    pub raw: i64,
}

/// Returns the last native failure translated on the calling thread.
pub fn adapter_get_last_error() -> Option<AdapterError> {
    LAST_ADAPTER_ERROR.with(|slot| slot.borrow().clone())
}

/// Translates a native status into an [`Error`].
///
/// Also records the failure as this thread's last adapter error. A failed
/// call is never reported as [`ResultCode::Success`], even when the backend
/// maps the status there.
pub fn translate<S: NativeStatus>(backend: &'static str, call: &'static str, status: S) -> Error {
    let code = match status.to_result_code() {
        ResultCode::Success => ResultCode::Unknown,
        code => code,
    };
    let detail = status.to_string();
    LAST_ADAPTER_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(AdapterError {
            backend,
            message: format!("{call}: {detail}"),
            raw: status.raw(),
        });
    });
    Error::Native {
        backend,
        call,
        raw: status.raw(),
        detail,
        code,
    }
}

/// Extension for routing native results through the translator.
pub trait NativeResultExt<T> {
    /// Translates a native failure, tagging it with the backend and call.
    fn native(self, backend: &'static str, call: &'static str) -> Result<T>;
}

impl<T, S: NativeStatus> NativeResultExt<T> for std::result::Result<T, S> {
    fn native(self, backend: &'static str, call: &'static str) -> Result<T> {
        self.map_err(|status| translate(backend, call, status))
    }
}

/// Renders a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f` at the public boundary and reduces the outcome to a [`ResultCode`].
///
/// Panics are caught here so that nothing unwinds across the boundary.
pub fn boundary<F>(operation: &'static str, f: F) -> ResultCode
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => ResultCode::Success,
        Ok(Err(err)) => {
            match &err {
                Error::Internal(_) | Error::Panicked(_) => {
                    tracing::error!(operation, error = %err, "operation failed")
                }
                _ => tracing::debug!(operation, error = %err, "operation failed"),
            }
            err.code()
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(operation, %message, "panic caught at runtime boundary");
            ResultCode::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct FakeStatus(i64);

    impl fmt::Display for FakeStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FAKE_{}", self.0)
        }
    }

    impl NativeStatus for FakeStatus {
        fn raw(&self) -> i64 {
            self.0
        }

        fn to_result_code(&self) -> ResultCode {
            match self.0 {
                0 => ResultCode::Success,
                1 => ResultCode::InvalidValue,
                2 => ResultCode::OutOfDeviceMemory,
                _ => ResultCode::Unknown,
            }
        }
    }

    #[test]
    fn test_result_code_raw_roundtrip() {
        for code in ResultCode::ALL {
            assert_eq!(ResultCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(ResultCode::from_raw(-1), None);
    }

    #[test]
    fn test_result_codes_unique() {
        let mut raws: Vec<i32> = ResultCode::ALL.iter().map(|c| c.as_raw()).collect();
        raws.sort_unstable();
        raws.dedup();
        assert_eq!(raws.len(), ResultCode::ALL.len());
    }

    #[test]
    fn test_translate_records_last_error() {
        let err = translate("fake", "stream_wait_event", FakeStatus(2));
        assert_eq!(err.code(), ResultCode::OutOfDeviceMemory);
        assert!(err.is_native());

        let last = adapter_get_last_error().expect("last error recorded");
        assert_eq!(last.backend, "fake");
        assert_eq!(last.raw, 2);
        assert!(last.message.contains("stream_wait_event"));
    }

    #[test]
    fn test_unmapped_native_status_is_unknown() {
        let result: std::result::Result<(), FakeStatus> = Err(FakeStatus(12345));
        let err = result.native("fake", "event_record").unwrap_err();
        assert_eq!(err.code(), ResultCode::Unknown);
    }

    #[test]
    fn test_success_status_never_reported_as_success() {
        let err = translate("fake", "native_command", FakeStatus(0));
        assert_eq!(err.code(), ResultCode::Unknown);

        let code = boundary("test", || Err(translate("fake", "native_command", FakeStatus(0))));
        assert_eq!(code, ResultCode::Unknown);
    }

    #[test]
    fn test_usage_errors_propagate_unchanged() {
        let err = Error::usage(ResultCode::InvalidEventWaitList, "bad list");
        assert_eq!(err.code(), ResultCode::InvalidEventWaitList);
        assert!(!err.is_native());
    }

    #[test]
    fn test_internal_error_code() {
        assert_eq!(
            Error::internal("recorded twice").code(),
            ResultCode::InvalidOperation
        );
    }

    #[test]
    fn test_boundary_catches_panics() {
        let code = boundary("test", || panic!("boom"));
        assert_eq!(code, ResultCode::Unknown);
    }

    #[test]
    fn test_boundary_maps_errors() {
        assert_eq!(boundary("test", || Ok(())), ResultCode::Success);
        assert_eq!(
            boundary("test", || Err(Error::usage(ResultCode::InvalidSize, "x"))),
            ResultCode::InvalidSize
        );
    }
}
