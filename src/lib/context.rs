//! # AMDGPU device context
//!
//! `DeviceContext` binds the process to device 0, records its compute
//! capability and target architecture, and owns the lock that serializes
//! kernel enqueues. Everything except the lock is immutable after
//! construction, so a context can be shared freely across threads.
//!
//! Most callers use the process-wide instance from [`DeviceContext::global`]
//! (or [`DeviceContext::init_global`] to choose the driver and settings).
//! Hosts that prefer to own the context can call [`DeviceContext::new`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::demangle::{Demangler, OfflineCacheDemangler};
use crate::driver::{ContextHandle, DeviceHandle, Driver, DriverError, HipDriver, MemInfo};
use crate::profiler::KernelProfiler;
use crate::props::{probe_arch, ArchInfo, ProbeError, PropsLayout, PROPS_BUFFER_SIZE};

const GB: f64 = (1u64 << 30) as f64;

/// Errors that can occur while creating the device context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("no AMDGPU device found")]
    NoDevice,
    #[error("driver error during context creation: {0}")]
    Driver(#[from] DriverError),
    #[error("device property probe failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Construction-time settings. Fixed for the lifetime of the context.
#[derive(Clone)]
pub struct ContextConfig {
    /// Synchronize the default stream after every launch so device faults
    /// surface at the launching call.
    pub debug: bool,
    pub profiler: Option<Arc<dyn KernelProfiler>>,
    pub demangler: Option<Arc<dyn Demangler>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            debug: false,
            profiler: None,
            demangler: Some(Arc::new(OfflineCacheDemangler)),
        }
    }
}

impl ContextConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn KernelProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn with_demangler(mut self, demangler: Arc<dyn Demangler>) -> Self {
        self.demangler = Some(demangler);
        self
    }

    /// Use raw task names as profiler labels.
    pub fn without_demangler(mut self) -> Self {
        self.demangler = None;
        self
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("debug", &self.debug)
            .field("profiler", &self.profiler.is_some())
            .field("demangler", &self.demangler.is_some())
            .finish()
    }
}

/// Snapshot of the device for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub device_count: i32,
    pub compute_capability: u32,
    pub mcpu: String,
    pub props_layout: PropsLayout,
    pub memory: MemInfo,
    pub debug: bool,
    pub profiling: bool,
}

/// Execution context for the single AMDGPU device this process drives.
pub struct DeviceContext {
    pub(crate) driver: Arc<dyn Driver>,
    device: DeviceHandle,
    context: ContextHandle,
    device_count: i32,
    arch: ArchInfo,
    pub(crate) debug: bool,
    pub(crate) profiler: Option<Arc<dyn KernelProfiler>>,
    pub(crate) demangler: Option<Arc<dyn Demangler>>,
    /// Held only while a launch is enqueued.
    pub(crate) launch_lock: Mutex<()>,
}

static GLOBAL: OnceLock<Result<DeviceContext, ContextError>> = OnceLock::new();

impl DeviceContext {
    /// Initialize the driver, bind device 0 and probe its architecture.
    pub fn new(driver: Arc<dyn Driver>, config: ContextConfig) -> Result<Self, ContextError> {
        driver.init(0)?;
        let device_count = driver.device_get_count()?;
        if device_count < 1 {
            return Err(ContextError::NoDevice);
        }
        let device = driver.device_get(0)?;

        let name = driver.device_get_name(device)?;
        info!("Using AMDGPU device [id=0]: {}", name);

        let context = driver.context_create(0, device)?;

        let mem = driver.mem_get_info()?;
        info!(
            "Total memory {:.2} GB; free memory {:.2} GB",
            mem.total as f64 / GB,
            mem.free as f64 / GB
        );

        let mut raw = vec![0u8; PROPS_BUFFER_SIZE];
        driver.device_get_prop(device, &mut raw)?;
        let runtime_version = driver.runtime_get_version()?;
        let arch = probe_arch(&raw, runtime_version)?;

        info!(
            "Emitting AMDGPU code for {} (compute capability {}, {:?} properties, runtime {})",
            arch.mcpu, arch.compute_capability, arch.layout, runtime_version
        );

        Ok(Self {
            driver,
            device,
            context,
            device_count,
            arch,
            debug: config.debug,
            profiler: config.profiler,
            demangler: config.demangler,
            launch_lock: Mutex::new(()),
        })
    }

    /// Create the process-wide context with the given driver and settings.
    ///
    /// The first call wins; later calls return the existing context (or the
    /// original failure) and ignore their arguments.
    pub fn init_global(
        driver: Arc<dyn Driver>,
        config: ContextConfig,
    ) -> Result<&'static DeviceContext, ContextError> {
        let mut created = false;
        let slot = GLOBAL.get_or_init(|| {
            created = true;
            DeviceContext::new(driver, config)
        });
        if !created {
            debug!("Device context already initialized; new driver and config ignored");
        }
        slot.as_ref().map_err(Clone::clone)
    }

    /// The process-wide context, created over `libamdhip64.so` with default
    /// settings on first access.
    ///
    /// A failed initialization is cached: a context whose architecture could
    /// not be decoded must never be used, so every later call returns the
    /// same error.
    pub fn global() -> Result<&'static DeviceContext, ContextError> {
        GLOBAL
            .get_or_init(|| {
                let driver = HipDriver::load()?;
                DeviceContext::new(Arc::new(driver), ContextConfig::default())
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn context_handle(&self) -> ContextHandle {
        self.context
    }

    pub fn device_count(&self) -> i32 {
        self.device_count
    }

    /// `major * 100 + minor * 10`, e.g. 900 for gfx90a.
    pub fn compute_capability(&self) -> u32 {
        self.arch.compute_capability
    }

    /// Target architecture without feature qualifiers, e.g. `gfx90a`.
    pub fn mcpu(&self) -> &str {
        &self.arch.mcpu
    }

    pub fn arch(&self) -> &ArchInfo {
        &self.arch
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn profiler(&self) -> Option<&Arc<dyn KernelProfiler>> {
        self.profiler.as_ref()
    }

    pub fn device_name(&self) -> Result<String, DriverError> {
        self.driver.device_get_name(self.device)
    }

    pub fn mem_info(&self) -> Result<MemInfo, DriverError> {
        self.driver.mem_get_info()
    }

    pub fn total_memory(&self) -> Result<usize, DriverError> {
        Ok(self.mem_info()?.total)
    }

    pub fn free_memory(&self) -> Result<usize, DriverError> {
        Ok(self.mem_info()?.free)
    }

    pub fn report(&self) -> Result<DeviceReport, DriverError> {
        Ok(DeviceReport {
            name: self.device_name()?,
            device_count: self.device_count,
            compute_capability: self.arch.compute_capability,
            mcpu: self.arch.mcpu.clone(),
            props_layout: self.arch.layout,
            memory: self.mem_info()?,
            debug: self.debug,
            profiling: self.profiler.is_some(),
        })
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("device_count", &self.device_count)
            .field("arch", &self.arch)
            .field("debug", &self.debug)
            .field("profiler", &self.profiler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;

    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::props::props_blob;

    fn mock(layout: PropsLayout, arch: &str, runtime_version: i32) -> Arc<MockDriver> {
        Arc::new(MockDriver::new(
            props_blob(layout, 9, 0, arch),
            runtime_version,
        ))
    }

    #[test]
    fn test_context_from_r0000_props() {
        let driver = mock(PropsLayout::R0000, "gfx90a:sramecc+:xnack-", 50_731_921);
        let ctx = DeviceContext::new(driver, ContextConfig::default()).unwrap();
        assert_eq!(ctx.compute_capability(), 900);
        assert_eq!(ctx.mcpu(), "gfx90a");
        assert_eq!(ctx.device_count(), 1);
        assert_eq!(ctx.device(), DeviceHandle(0));
        assert!(!ctx.is_debug());
        assert!(ctx.profiler().is_none());
    }

    #[test]
    fn test_context_falls_back_to_r0600_on_rocm6() {
        let driver = mock(PropsLayout::R0600, "gfx90a:xnack-", 60_032_830);
        let ctx = DeviceContext::new(driver, ContextConfig::default()).unwrap();
        assert_eq!(ctx.mcpu(), "gfx90a");
        assert_eq!(ctx.arch().layout, PropsLayout::R0600);
    }

    #[test]
    fn test_context_layout_mismatch_is_fatal() {
        let driver = mock(PropsLayout::R0600, "gfx90a", 50_700_000);
        let err = DeviceContext::new(driver, ContextConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ContextError::Probe(ProbeError::LayoutMismatch {
                runtime_version: 50_700_000
            })
        );
    }

    #[test]
    fn test_memory_and_report() {
        let driver = mock(PropsLayout::R0000, "gfx1100", 60_000_000);
        let ctx = DeviceContext::new(driver, ContextConfig::default().with_debug(true)).unwrap();
        assert_eq!(ctx.total_memory().unwrap(), 64 << 30);
        assert_eq!(ctx.free_memory().unwrap(), 60 << 30);

        let report = ctx.report().unwrap();
        assert_eq!(report.name, "AMD Instinct MI210");
        assert_eq!(report.mcpu, "gfx1100");
        assert!(report.debug);
        assert!(!report.profiling);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["props_layout"], "R0000");
        assert_eq!(json["memory"]["total"], 64u64 << 30);
    }

    #[test]
    fn test_global_initialized_once_under_contention() {
        const THREADS: usize = 8;
        let drivers: Vec<Arc<MockDriver>> = (0..THREADS)
            .map(|_| mock(PropsLayout::R0000, "gfx90a", 60_000_000))
            .collect();
        let shared = mock(PropsLayout::R0000, "gfx1100", 60_000_000);
        let barrier = Barrier::new(2 * THREADS);

        let contexts: Vec<&'static DeviceContext> = std::thread::scope(|s| {
            let own = drivers.iter().map(|driver| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    DeviceContext::init_global(driver.clone(), ContextConfig::default()).unwrap()
                })
            });
            let same = (0..THREADS).map(|_| {
                let barrier = &barrier;
                let shared = &shared;
                s.spawn(move || {
                    barrier.wait();
                    DeviceContext::init_global(shared.clone(), ContextConfig::default()).unwrap()
                })
            });
            let handles: Vec<_> = own.chain(same).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = contexts[0];
        assert!(contexts.iter().all(|ctx| std::ptr::eq(*ctx, first)));
        assert!(std::ptr::eq(DeviceContext::global().unwrap(), first));

        let count_calls: usize = drivers
            .iter()
            .chain(std::iter::once(&shared))
            .map(|driver| driver.count_calls.load(Ordering::SeqCst))
            .sum();
        assert_eq!(count_calls, 1);
    }

    #[test]
    fn test_config_debug_format() {
        let config = ContextConfig::default().without_demangler().with_debug(true);
        assert_eq!(
            format!("{:?}", config),
            "ContextConfig { debug: true, profiler: false, demangler: false }"
        );
    }
}
