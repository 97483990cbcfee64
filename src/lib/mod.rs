//! # AMDGPU Kernel Launcher
//!
//! This crate owns the execution context of a single AMD GPU and launches
//! compute kernels on it through the HIP runtime. It covers the three parts of
//! a launch that are easy to get subtly wrong:
//!
//! - probing the device's compute capability and target architecture from a
//!   `hipDeviceProp_t` whose binary layout differs between ROCm 5 and ROCm 6,
//! - packing kernel arguments into the single byte buffer the AMDGPU kernel
//!   ABI expects, with its order-sensitive 32-byte alignment rules,
//! - enqueueing launches from many threads while keeping the driver call
//!   serialized, with optional profiling and synchronous fault reporting.
//!
//! ## Core Modules
//!
//! - `driver`: the `Driver` trait and its `libamdhip64.so` implementation.
//! - `props`: versioned views over the device property struct.
//! - `context`: the process-wide `DeviceContext`.
//! - `packer`: kernel argument views and the packing algorithm.
//! - `launch`: `DeviceContext::launch`.
//! - `profiler`: profiler trait and a wall-clock backend.
//! - `demangle`: offline-cache kernel name demangling for trace labels.

pub mod context;
pub mod demangle;
pub mod driver;
pub mod ffi; // Runtime-loaded HIP entry points
pub mod launch;
pub mod packer;
pub mod profiler;
pub mod props;

pub use context::{ContextConfig, ContextError, DeviceContext, DeviceReport};
pub use demangle::{Demangled, Demangler, OfflineCacheDemangler};
pub use driver::{Driver, DriverError, HipDriver, KernelFunction, MemInfo, StreamHandle};
pub use launch::{LaunchConfig, LaunchError};
pub use packer::{compute_packed_size, pack, ArgLayout, ArgSlot, KernelArg, PackError, PackedArgs};
pub use profiler::{KernelProfiler, TaskHandle, TraceRecord, WallClockProfiler};
pub use props::{ArchInfo, ProbeError, PropsLayout};

// Re-export common types
pub use anyhow::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
