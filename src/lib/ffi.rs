//! # Runtime-loaded HIP entry points
//!
//! The HIP runtime is resolved from `libamdhip64.so` with `dlopen` so the crate
//! builds and its pure parts run on machines without ROCm installed. Only the
//! handful of calls the device context needs are resolved.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

use libloading::Library;

/// HIP status code (`hipError_t`).
pub type HipErrorT = c_int;
pub const HIP_SUCCESS: HipErrorT = 0;

// Opaque handles
pub type HipDevice = c_int;
pub type HipCtx = *mut c_void;
pub type HipFunction = *mut c_void;
pub type HipStream = *mut c_void;

// Markers for the `extra` argument of hipModuleLaunchKernel
pub const HIP_LAUNCH_PARAM_BUFFER_POINTER: usize = 0x01;
pub const HIP_LAUNCH_PARAM_BUFFER_SIZE: usize = 0x02;
pub const HIP_LAUNCH_PARAM_END: usize = 0x03;

type FnHipInit = unsafe extern "C" fn(c_uint) -> HipErrorT;
type FnHipGetDeviceCount = unsafe extern "C" fn(*mut c_int) -> HipErrorT;
type FnHipDeviceGet = unsafe extern "C" fn(*mut HipDevice, c_int) -> HipErrorT;
type FnHipDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, HipDevice) -> HipErrorT;
type FnHipGetDeviceProperties = unsafe extern "C" fn(*mut c_void, c_int) -> HipErrorT;
type FnHipMemGetInfo = unsafe extern "C" fn(*mut usize, *mut usize) -> HipErrorT;
type FnHipCtxCreate = unsafe extern "C" fn(*mut HipCtx, c_uint, HipDevice) -> HipErrorT;
type FnHipRuntimeGetVersion = unsafe extern "C" fn(*mut c_int) -> HipErrorT;
type FnHipModuleLaunchKernel = unsafe extern "C" fn(
    HipFunction,
    c_uint, c_uint, c_uint, // grid x, y, z
    c_uint, c_uint, c_uint, // block x, y, z
    c_uint,                 // dynamic shared mem bytes
    HipStream,              // null = default stream
    *mut *mut c_void,       // kernel params
    *mut *mut c_void,       // extra
) -> HipErrorT;
type FnHipStreamSynchronize = unsafe extern "C" fn(HipStream) -> HipErrorT;

/// Function table resolved from `libamdhip64.so`.
pub struct HipApi {
    _lib: Library,
    pub hip_init: FnHipInit,
    pub hip_get_device_count: FnHipGetDeviceCount,
    pub hip_device_get: FnHipDeviceGet,
    pub hip_device_get_name: FnHipDeviceGetName,
    pub hip_get_device_properties: FnHipGetDeviceProperties,
    pub hip_mem_get_info: FnHipMemGetInfo,
    pub hip_ctx_create: FnHipCtxCreate,
    pub hip_runtime_get_version: FnHipRuntimeGetVersion,
    pub hip_module_launch_kernel: FnHipModuleLaunchKernel,
    pub hip_stream_synchronize: FnHipStreamSynchronize,
}

// Safety: the function pointers are process-global and the HIP runtime
// synchronizes internally.
unsafe impl Send for HipApi {}
unsafe impl Sync for HipApi {}

static HIP_API: OnceLock<Option<HipApi>> = OnceLock::new();

impl HipApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libamdhip64.so") }.ok()?;
        unsafe {
            let api = HipApi {
                hip_init: *lib.get::<FnHipInit>(b"hipInit\0").ok()?,
                hip_get_device_count: *lib.get::<FnHipGetDeviceCount>(b"hipGetDeviceCount\0").ok()?,
                hip_device_get: *lib.get::<FnHipDeviceGet>(b"hipDeviceGet\0").ok()?,
                hip_device_get_name: *lib.get::<FnHipDeviceGetName>(b"hipDeviceGetName\0").ok()?,
                // The unversioned symbol; which struct layout it fills is
                // resolved by the property probe.
                hip_get_device_properties: *lib
                    .get::<FnHipGetDeviceProperties>(b"hipGetDeviceProperties\0")
                    .ok()?,
                hip_mem_get_info: *lib.get::<FnHipMemGetInfo>(b"hipMemGetInfo\0").ok()?,
                hip_ctx_create: *lib.get::<FnHipCtxCreate>(b"hipCtxCreate\0").ok()?,
                hip_runtime_get_version: *lib
                    .get::<FnHipRuntimeGetVersion>(b"hipRuntimeGetVersion\0")
                    .ok()?,
                hip_module_launch_kernel: *lib
                    .get::<FnHipModuleLaunchKernel>(b"hipModuleLaunchKernel\0")
                    .ok()?,
                hip_stream_synchronize: *lib
                    .get::<FnHipStreamSynchronize>(b"hipStreamSynchronize\0")
                    .ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded HIP API. Returns None if libamdhip64.so is not found
/// or lacks one of the required symbols.
pub fn hip_api() -> Option<&'static HipApi> {
    HIP_API.get_or_init(HipApi::try_load).as_ref()
}
