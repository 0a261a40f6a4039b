//! CUDA driver API implementation of [`Driver`].

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use cudarc::driver::sys as cuda_sys;

use unirt_core::{Driver, EventFlags, HostFn};

use crate::status::CudaStatus;

/// Primary context of a CUDA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CudaContext(cuda_sys::CUcontext);

/// Non-blocking CUDA stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CudaStream(cuda_sys::CUstream);

impl CudaStream {
    /// Raw stream handle for native interop.
    pub fn raw(self) -> cuda_sys::CUstream {
        self.0
    }
}

/// CUDA event.
#[derive(Debug)]
pub struct CudaEvent {
    raw: cuda_sys::CUevent,
    timing: bool,
}

impl CudaEvent {
    /// Raw event handle for native interop.
    pub fn raw(&self) -> cuda_sys::CUevent {
        self.raw
    }

    /// Whether the event records timestamps.
    pub fn timing_enabled(&self) -> bool {
        self.timing
    }
}

// CUDA handles are usable from any thread once the owning context is
// current there.
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}
unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}
unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

struct DeviceEntry {
    device: cuda_sys::CUdevice,
    context: CudaContext,
    name: String,
}

/// Driver over the CUDA driver API, using each device's primary context.
pub struct CudaDriver {
    devices: Vec<DeviceEntry>,
}

// Only immutable device bookkeeping lives here.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Initializes the driver API and retains every device's primary
    /// context.
    pub fn new() -> Result<Self, CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuInit(0))? };

        let mut count = 0;
        unsafe { CudaStatus::check(cuda_sys::cuDeviceGetCount(&mut count))? };

        let mut devices = Vec::with_capacity(count.max(0) as usize);
        for ordinal in 0..count {
            match Self::open_device(ordinal) {
                Ok(entry) => devices.push(entry),
                Err(status) => {
                    release_primary_contexts(&devices);
                    return Err(status);
                }
            }
        }

        tracing::info!(devices = devices.len(), "Initialized CUDA driver");
        Ok(Self { devices })
    }

    fn open_device(ordinal: i32) -> Result<DeviceEntry, CudaStatus> {
        let mut device = 0;
        unsafe { CudaStatus::check(cuda_sys::cuDeviceGet(&mut device, ordinal))? };

        let mut name = [0 as c_char; 256];
        unsafe {
            CudaStatus::check(cuda_sys::cuDeviceGetName(
                name.as_mut_ptr(),
                name.len() as i32,
                device,
            ))?;
        }
        let name = unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut context = ptr::null_mut();
        unsafe { CudaStatus::check(cuda_sys::cuDevicePrimaryCtxRetain(&mut context, device))? };

        tracing::debug!(ordinal, %name, "Retained CUDA primary context");
        Ok(DeviceEntry {
            device,
            context: CudaContext(context),
            name,
        })
    }

    fn entry(&self, ordinal: usize) -> Result<&DeviceEntry, CudaStatus> {
        self.devices
            .get(ordinal)
            .ok_or(CudaStatus(cuda_sys::CUresult::CUDA_ERROR_INVALID_DEVICE))
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        release_primary_contexts(&self.devices);
    }
}

fn release_primary_contexts(devices: &[DeviceEntry]) {
    for entry in devices {
        if let Err(status) =
            unsafe { CudaStatus::check(cuda_sys::cuDevicePrimaryCtxRelease_v2(entry.device)) }
        {
            tracing::warn!(%status, device = entry.device, "Failed to release primary context");
        }
    }
}

unsafe extern "C" fn host_fn_trampoline(data: *mut c_void) {
    // SAFETY: `data` was produced by `Box::into_raw` in `enqueue_host_fn` and
    // CUDA calls the trampoline exactly once.
    let f = unsafe { Box::from_raw(data as *mut HostFn) };
    if panic::catch_unwind(AssertUnwindSafe(move || f())).is_err() {
        tracing::warn!("Host function panicked on CUDA stream");
    }
}

/// Launches `f` on `stream`, handing the closure back if CUDA rejects it.
fn enqueue_host_fn(stream: CudaStream, f: HostFn) -> Result<(), (CudaStatus, HostFn)> {
    let data = Box::into_raw(Box::new(f)) as *mut c_void;
    let result = unsafe { cuda_sys::cuLaunchHostFunc(stream.0, Some(host_fn_trampoline), data) };
    CudaStatus::check(result).map_err(|status| {
        // SAFETY: the trampoline will never run, so ownership is still ours.
        let f = unsafe { *Box::from_raw(data as *mut HostFn) };
        (status, f)
    })
}

impl Driver for CudaDriver {
    const NAME: &'static str = "cuda";

    type Status = CudaStatus;
    type Context = CudaContext;
    type Stream = CudaStream;
    type Event = CudaEvent;
    type DevicePtr = cuda_sys::CUdeviceptr;

    fn device_count(&self) -> Result<usize, CudaStatus> {
        Ok(self.devices.len())
    }

    fn device_context(&self, ordinal: usize) -> Result<CudaContext, CudaStatus> {
        Ok(self.entry(ordinal)?.context)
    }

    fn device_name(&self, ordinal: usize) -> Result<String, CudaStatus> {
        Ok(self.entry(ordinal)?.name.clone())
    }

    fn current_context(&self) -> Result<Option<CudaContext>, CudaStatus> {
        let mut context = ptr::null_mut();
        unsafe { CudaStatus::check(cuda_sys::cuCtxGetCurrent(&mut context))? };
        Ok((!context.is_null()).then_some(CudaContext(context)))
    }

    fn set_current_context(&self, context: Option<CudaContext>) -> Result<(), CudaStatus> {
        let raw = context.map_or(ptr::null_mut(), |c| c.0);
        unsafe { CudaStatus::check(cuda_sys::cuCtxSetCurrent(raw)) }
    }

    fn stream_create(&self) -> Result<CudaStream, CudaStatus> {
        let mut stream = ptr::null_mut();
        unsafe {
            CudaStatus::check(cuda_sys::cuStreamCreate(
                &mut stream,
                cuda_sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
            ))?;
        }
        Ok(CudaStream(stream))
    }

    fn stream_destroy(&self, stream: CudaStream) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuStreamDestroy_v2(stream.0)) }
    }

    fn stream_synchronize(&self, stream: CudaStream) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuStreamSynchronize(stream.0)) }
    }

    fn stream_wait_event(&self, stream: CudaStream, event: &CudaEvent) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuStreamWaitEvent(stream.0, event.raw, 0)) }
    }

    fn event_create(&self, flags: EventFlags) -> Result<CudaEvent, CudaStatus> {
        let cuda_flags = match flags {
            EventFlags::Default => cuda_sys::CUevent_flags::CU_EVENT_DEFAULT,
            EventFlags::DisableTiming => cuda_sys::CUevent_flags::CU_EVENT_DISABLE_TIMING,
        };
        let mut event = ptr::null_mut();
        unsafe { CudaStatus::check(cuda_sys::cuEventCreate(&mut event, cuda_flags as u32))? };
        Ok(CudaEvent {
            raw: event,
            timing: flags.timing_enabled(),
        })
    }

    fn event_record(&self, event: &CudaEvent, stream: CudaStream) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuEventRecord(event.raw, stream.0)) }
    }

    fn event_query(&self, event: &CudaEvent) -> Result<bool, CudaStatus> {
        match unsafe { cuda_sys::cuEventQuery(event.raw) } {
            cuda_sys::CUresult::CUDA_SUCCESS => Ok(true),
            cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(CudaStatus(other)),
        }
    }

    fn event_synchronize(&self, event: &CudaEvent) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuEventSynchronize(event.raw)) }
    }

    fn event_elapsed_ns(&self, start: &CudaEvent, end: &CudaEvent) -> Result<u64, CudaStatus> {
        let mut ms = 0.0f32;
        unsafe { CudaStatus::check(cuda_sys::cuEventElapsedTime(&mut ms, start.raw, end.raw))? };
        Ok((f64::from(ms.max(0.0)) * 1_000_000.0) as u64)
    }

    fn event_destroy(&self, event: CudaEvent) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuEventDestroy_v2(event.raw)) }
    }

    fn launch_host_fn(&self, stream: CudaStream, f: HostFn) -> Result<(), CudaStatus> {
        enqueue_host_fn(stream, f).map_err(|(status, _)| status)
    }

    fn mem_alloc(&self, size: usize) -> Result<cuda_sys::CUdeviceptr, CudaStatus> {
        let mut ptr = 0;
        unsafe { CudaStatus::check(cuda_sys::cuMemAlloc_v2(&mut ptr, size))? };
        Ok(ptr)
    }

    fn mem_free(&self, ptr: cuda_sys::CUdeviceptr) -> Result<(), CudaStatus> {
        unsafe { CudaStatus::check(cuda_sys::cuMemFree_v2(ptr)) }
    }

    fn memcpy_htod_async(
        &self,
        stream: CudaStream,
        dst: cuda_sys::CUdeviceptr,
        offset: usize,
        src: Vec<u8>,
    ) -> Result<(), CudaStatus> {
        unsafe {
            CudaStatus::check(cuda_sys::cuMemcpyHtoDAsync_v2(
                dst + offset as cuda_sys::CUdeviceptr,
                src.as_ptr() as *const c_void,
                src.len(),
                stream.0,
            ))?;
        }
        // The source must outlive the copy; free it from the stream once the
        // copy has been consumed.
        enqueue_host_fn(stream, Box::new(move || drop(src))).or_else(|(status, keep_alive)| {
            unsafe {
                let _ = cuda_sys::cuStreamSynchronize(stream.0);
            }
            drop(keep_alive);
            Err(status)
        })
    }

    fn memcpy_dtoh(
        &self,
        stream: CudaStream,
        src: cuda_sys::CUdeviceptr,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), CudaStatus> {
        unsafe {
            CudaStatus::check(cuda_sys::cuMemcpyDtoHAsync_v2(
                dst.as_mut_ptr() as *mut c_void,
                src + offset as cuda_sys::CUdeviceptr,
                dst.len(),
                stream.0,
            ))?;
            CudaStatus::check(cuda_sys::cuStreamSynchronize(stream.0))
        }
    }
}
