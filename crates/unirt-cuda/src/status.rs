//! CUDA driver status translation.

use std::fmt;

use cudarc::driver::sys as cuda_sys;
use cuda_sys::CUresult;

use unirt_core::{NativeStatus, ResultCode};

/// A failed `CUresult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CudaStatus(pub CUresult);

impl CudaStatus {
    /// Converts a driver return value, treating `CUDA_SUCCESS` as `Ok`.
    pub fn check(result: CUresult) -> Result<(), CudaStatus> {
        if result == CUresult::CUDA_SUCCESS {
            Ok(())
        } else {
            Err(CudaStatus(result))
        }
    }
}

impl fmt::Display for CudaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::error::Error for CudaStatus {}

impl NativeStatus for CudaStatus {
    fn raw(&self) -> i64 {
        self.0 as i64
    }

    fn to_result_code(&self) -> ResultCode {
        match self.0 {
            CUresult::CUDA_ERROR_NOT_PERMITTED | CUresult::CUDA_ERROR_NOT_READY => {
                ResultCode::InvalidOperation
            }
            CUresult::CUDA_ERROR_INVALID_CONTEXT | CUresult::CUDA_ERROR_CONTEXT_IS_DESTROYED => {
                ResultCode::InvalidContext
            }
            CUresult::CUDA_ERROR_INVALID_DEVICE | CUresult::CUDA_ERROR_NO_DEVICE => {
                ResultCode::InvalidDevice
            }
            CUresult::CUDA_ERROR_INVALID_VALUE | CUresult::CUDA_ERROR_INVALID_HANDLE => {
                ResultCode::InvalidValue
            }
            CUresult::CUDA_ERROR_OUT_OF_MEMORY => ResultCode::OutOfDeviceMemory,
            CUresult::CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => ResultCode::OutOfResources,
            CUresult::CUDA_ERROR_NOT_INITIALIZED | CUresult::CUDA_ERROR_DEINITIALIZED => {
                ResultCode::Uninitialized
            }
            CUresult::CUDA_ERROR_NOT_SUPPORTED => ResultCode::UnsupportedFeature,
            CUresult::CUDA_ERROR_LAUNCH_FAILED | CUresult::CUDA_ERROR_ILLEGAL_ADDRESS => {
                ResultCode::DeviceLost
            }
            _ => ResultCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_translation() {
        assert_eq!(
            CudaStatus(CUresult::CUDA_ERROR_OUT_OF_MEMORY).to_result_code(),
            ResultCode::OutOfDeviceMemory
        );
        assert_eq!(
            CudaStatus(CUresult::CUDA_ERROR_INVALID_CONTEXT).to_result_code(),
            ResultCode::InvalidContext
        );
        assert_eq!(
            CudaStatus(CUresult::CUDA_ERROR_UNKNOWN).to_result_code(),
            ResultCode::Unknown
        );
        // Only reachable when a caller wraps a success value as a failure.
        assert_eq!(
            CudaStatus(CUresult::CUDA_SUCCESS).to_result_code(),
            ResultCode::Unknown
        );
    }

    #[test]
    fn test_check() {
        assert!(CudaStatus::check(CUresult::CUDA_SUCCESS).is_ok());
        assert_eq!(
            CudaStatus::check(CUresult::CUDA_ERROR_NOT_READY),
            Err(CudaStatus(CUresult::CUDA_ERROR_NOT_READY))
        );
    }
}
