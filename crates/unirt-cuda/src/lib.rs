//! CUDA backend for unirt.
//!
//! [`CudaDriver`] implements [`unirt_core::Driver`] over the CUDA driver API
//! through `cudarc`. Each device is driven through its primary context;
//! queue streams are created non-blocking so that ordering comes only from
//! explicit event waits.
//!
//! # Requirements
//!
//! - the `cuda` feature
//! - an installed CUDA driver (the library is loaded at runtime)
//!
//! Without the `cuda` feature a stub [`CudaDriver`] is compiled whose
//! constructor always fails.

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "cuda")]
mod driver;
#[cfg(feature = "cuda")]
mod status;

#[cfg(feature = "cuda")]
pub use driver::{CudaContext, CudaDriver, CudaEvent, CudaStream};
#[cfg(feature = "cuda")]
pub use status::CudaStatus;

/// Errors opening the CUDA backend.
#[derive(Debug, thiserror::Error)]
pub enum CudaInitError {
    /// CUDA support is not compiled in or the driver library is missing.
    #[error("CUDA backend unavailable: {0}")]
    Unavailable(String),

    /// The driver API reported a failure during initialization.
    #[cfg(feature = "cuda")]
    #[error("CUDA driver initialization failed: {0}")]
    Driver(#[from] CudaStatus),
}

#[cfg(feature = "cuda")]
impl CudaDriver {
    /// Opens the CUDA driver, reporting a missing driver library as
    /// [`CudaInitError::Unavailable`] instead of panicking.
    pub fn open() -> Result<Self, CudaInitError> {
        match std::panic::catch_unwind(CudaDriver::new) {
            Ok(result) => Ok(result?),
            Err(_) => Err(CudaInitError::Unavailable(
                "CUDA driver library could not be loaded".to_string(),
            )),
        }
    }
}

// Placeholder when CUDA is not compiled in
#[cfg(not(feature = "cuda"))]
mod stub {
    use super::CudaInitError;

    /// Stub CUDA driver when the `cuda` feature is disabled.
    #[derive(Debug)]
    pub struct CudaDriver;

    impl CudaDriver {
        /// Always fails: CUDA support is not compiled in.
        pub fn open() -> Result<Self, CudaInitError> {
            Err(CudaInitError::Unavailable(
                "CUDA feature not enabled".to_string(),
            ))
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// Returns false if the `cuda` feature is disabled, the driver library is
/// not installed, or no device is present.
pub fn is_cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        use unirt_core::Driver;
        CudaDriver::open()
            .ok()
            .and_then(|driver| driver.device_count().ok())
            .is_some_and(|count| count > 0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_stub_is_unavailable() {
        assert!(!is_cuda_available());
        assert!(matches!(
            CudaDriver::open(),
            Err(CudaInitError::Unavailable(_))
        ));
    }
}
