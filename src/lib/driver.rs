//! # Driver Handle
//!
//! `Driver` is the seam between the device context and the native HIP runtime.
//! Every call returns the driver status as a `Result`; nothing is silently
//! ignored. `HipDriver` is the production implementation over the
//! runtime-loaded function table in [`crate::ffi`].

use std::ffi::{c_char, c_void, CStr};
use std::ptr;

use serde::Serialize;
use thiserror::Error;

use crate::ffi::{
    self, HipApi, HipErrorT, HIP_LAUNCH_PARAM_BUFFER_POINTER, HIP_LAUNCH_PARAM_BUFFER_SIZE,
    HIP_LAUNCH_PARAM_END, HIP_SUCCESS,
};
use crate::props::PROPS_BUFFER_SIZE;

/// Longest device name the driver is asked for.
const MAX_NAME_LEN: usize = 128;

/// Errors reported by a [`Driver`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("HIP runtime not available (libamdhip64.so not found)")]
    NotAvailable,
    #[error("HIP error {code} in {call}")]
    Hip { code: i32, call: &'static str },
    #[error("device property buffer too small: {len} bytes, need {required}")]
    PropertyBufferTooSmall { len: usize, required: usize },
}

/// Check a HIP return code.
pub fn check_hip(code: HipErrorT, call: &'static str) -> Result<(), DriverError> {
    if code == HIP_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Hip { code, call })
    }
}

/// Device ordinal handle (`hipDevice_t`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

/// Driver context handle (`hipCtx_t`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContextHandle(*mut c_void);

/// Loaded kernel entry point (`hipFunction_t`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelFunction(*mut c_void);

/// Execution stream (`hipStream_t`); the null stream is the default stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamHandle(*mut c_void);

// Safety: these are opaque tokens owned by the driver. They are never
// dereferenced on the host and HIP accepts them from any thread.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}
unsafe impl Send for KernelFunction {}
unsafe impl Sync for KernelFunction {}
unsafe impl Send for StreamHandle {}
unsafe impl Sync for StreamHandle {}

impl ContextHandle {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }
}

impl KernelFunction {
    /// Wrap a function handle obtained from `hipModuleGetFunction`.
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }
}

impl StreamHandle {
    /// The default (null) stream.
    pub const DEFAULT: StreamHandle = StreamHandle(ptr::null_mut());

    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_null()
    }
}

/// Three-dimensional launch extent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    /// One-dimensional extent `(x, 1, 1)`.
    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

/// Free and total device memory in bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub free: usize,
    pub total: usize,
}

/// Everything the driver needs for one enqueue. `args` is the packed
/// argument buffer and is passed by pointer and size, not per parameter.
#[derive(Debug)]
pub struct KernelLaunch<'a> {
    pub function: KernelFunction,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    pub stream: StreamHandle,
    pub args: &'a [u8],
}

/// The native calls the device context relies on.
pub trait Driver: Send + Sync {
    fn init(&self, flags: u32) -> Result<(), DriverError>;

    fn device_get_count(&self) -> Result<i32, DriverError>;

    fn device_get(&self, ordinal: i32) -> Result<DeviceHandle, DriverError>;

    fn device_get_name(&self, device: DeviceHandle) -> Result<String, DriverError>;

    /// Fill `out` with the raw device property struct. `out` must be at least
    /// [`PROPS_BUFFER_SIZE`] bytes so either struct layout fits.
    fn device_get_prop(&self, device: DeviceHandle, out: &mut [u8]) -> Result<(), DriverError>;

    fn mem_get_info(&self) -> Result<MemInfo, DriverError>;

    fn context_create(&self, flags: u32, device: DeviceHandle)
        -> Result<ContextHandle, DriverError>;

    fn runtime_get_version(&self) -> Result<i32, DriverError>;

    fn launch_kernel(&self, launch: &KernelLaunch<'_>) -> Result<(), DriverError>;

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), DriverError>;
}

/// [`Driver`] backed by `libamdhip64.so`.
pub struct HipDriver {
    api: &'static HipApi,
}

impl HipDriver {
    /// Resolve the HIP runtime. Fails with [`DriverError::NotAvailable`] when
    /// the library or one of its symbols is missing.
    pub fn load() -> Result<Self, DriverError> {
        let api = ffi::hip_api().ok_or(DriverError::NotAvailable)?;
        Ok(Self { api })
    }
}

impl Driver for HipDriver {
    fn init(&self, flags: u32) -> Result<(), DriverError> {
        check_hip(unsafe { (self.api.hip_init)(flags) }, "hipInit")
    }

    fn device_get_count(&self) -> Result<i32, DriverError> {
        let mut count = 0;
        check_hip(
            unsafe { (self.api.hip_get_device_count)(&mut count) },
            "hipGetDeviceCount",
        )?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> Result<DeviceHandle, DriverError> {
        let mut device = 0;
        check_hip(
            unsafe { (self.api.hip_device_get)(&mut device, ordinal) },
            "hipDeviceGet",
        )?;
        Ok(DeviceHandle(device))
    }

    fn device_get_name(&self, device: DeviceHandle) -> Result<String, DriverError> {
        let mut buf = [0u8; MAX_NAME_LEN];
        check_hip(
            unsafe {
                (self.api.hip_device_get_name)(
                    buf.as_mut_ptr() as *mut c_char,
                    MAX_NAME_LEN as i32,
                    device.0,
                )
            },
            "hipDeviceGetName",
        )?;
        let name = match CStr::from_bytes_until_nul(&buf) {
            Ok(c_str) => c_str.to_string_lossy().into_owned(),
            Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        };
        Ok(name)
    }

    fn device_get_prop(&self, device: DeviceHandle, out: &mut [u8]) -> Result<(), DriverError> {
        if out.len() < PROPS_BUFFER_SIZE {
            return Err(DriverError::PropertyBufferTooSmall {
                len: out.len(),
                required: PROPS_BUFFER_SIZE,
            });
        }
        // SAFETY: out is large enough for every known hipDeviceProp_t layout
        check_hip(
            unsafe { (self.api.hip_get_device_properties)(out.as_mut_ptr() as *mut c_void, device.0) },
            "hipGetDeviceProperties",
        )
    }

    fn mem_get_info(&self) -> Result<MemInfo, DriverError> {
        let mut info = MemInfo::default();
        check_hip(
            unsafe { (self.api.hip_mem_get_info)(&mut info.free, &mut info.total) },
            "hipMemGetInfo",
        )?;
        Ok(info)
    }

    fn context_create(
        &self,
        flags: u32,
        device: DeviceHandle,
    ) -> Result<ContextHandle, DriverError> {
        let mut context = ptr::null_mut();
        check_hip(
            unsafe { (self.api.hip_ctx_create)(&mut context, flags, device.0) },
            "hipCtxCreate",
        )?;
        Ok(ContextHandle(context))
    }

    fn runtime_get_version(&self) -> Result<i32, DriverError> {
        let mut version = 0;
        check_hip(
            unsafe { (self.api.hip_runtime_get_version)(&mut version) },
            "hipRuntimeGetVersion",
        )?;
        Ok(version)
    }

    fn launch_kernel(&self, launch: &KernelLaunch<'_>) -> Result<(), DriverError> {
        let mut size = launch.args.len();
        let mut extra: [*mut c_void; 5] = [
            HIP_LAUNCH_PARAM_BUFFER_POINTER as *mut c_void,
            launch.args.as_ptr() as *mut c_void,
            HIP_LAUNCH_PARAM_BUFFER_SIZE as *mut c_void,
            &mut size as *mut usize as *mut c_void,
            HIP_LAUNCH_PARAM_END as *mut c_void,
        ];
        // SAFETY: args and size outlive the call; the runtime copies the
        // argument buffer before hipModuleLaunchKernel returns
        check_hip(
            unsafe {
                (self.api.hip_module_launch_kernel)(
                    launch.function.as_raw(),
                    launch.grid.x,
                    launch.grid.y,
                    launch.grid.z,
                    launch.block.x,
                    launch.block.y,
                    launch.block.z,
                    launch.shared_mem_bytes,
                    launch.stream.as_raw(),
                    ptr::null_mut(),
                    extra.as_mut_ptr(),
                )
            },
            "hipModuleLaunchKernel",
        )
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), DriverError> {
        check_hip(
            unsafe { (self.api.hip_stream_synchronize)(stream.as_raw()) },
            "hipStreamSynchronize",
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_hip() {
        assert!(check_hip(HIP_SUCCESS, "hipInit").is_ok());
        let err = check_hip(100, "hipGetDeviceCount").unwrap_err();
        assert_eq!(
            err,
            DriverError::Hip {
                code: 100,
                call: "hipGetDeviceCount"
            }
        );
        assert_eq!(err.to_string(), "HIP error 100 in hipGetDeviceCount");
    }

    #[test]
    fn test_default_stream_is_null() {
        assert!(StreamHandle::DEFAULT.is_default());
        assert!(StreamHandle::DEFAULT.as_raw().is_null());
    }

    #[test]
    fn test_linear_dim() {
        assert_eq!(Dim3::linear(64), Dim3 { x: 64, y: 1, z: 1 });
    }
}
