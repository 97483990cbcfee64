//! # Kernel launch
//!
//! A launch runs entirely on the calling thread:
//!
//! 1. start a profiler span (if a profiler is attached),
//! 2. pack the arguments into a fresh buffer,
//! 3. enqueue under the context's launch lock (skipped when `grid_dim == 0`),
//! 4. release the buffer,
//! 5. stop the profiler span,
//! 6. in debug mode, synchronize the default stream so device faults surface
//!    here instead of at some later call.
//!
//! Only step 3 holds the lock; packing and profiling of concurrent launches
//! overlap freely. The span is stopped and the buffer released on every path,
//! including packing and driver failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::context::DeviceContext;
use crate::driver::{Dim3, DriverError, KernelFunction, KernelLaunch, StreamHandle};
use crate::packer::{KernelArg, PackError, PackedArgs};
use crate::profiler::TraceInfo;

/// One-dimensional launch geometry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Blocks in the grid. Zero makes the launch a no-op.
    pub grid_dim: u32,
    /// Threads per block.
    pub block_dim: u32,
    /// Dynamic shared memory per block, in bytes.
    pub shared_mem_bytes: usize,
}

impl LaunchConfig {
    pub fn new(grid_dim: u32, block_dim: u32) -> Self {
        Self {
            grid_dim,
            block_dim,
            shared_mem_bytes: 0,
        }
    }

    pub fn with_shared_mem(mut self, bytes: usize) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }
}

/// Errors that can occur during a launch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("failed to pack kernel arguments: {0}")]
    Pack(#[from] PackError),
    #[error("dynamic shared memory of {0} bytes does not fit the driver's 32-bit limit")]
    SharedMemTooLarge(usize),
    #[error("launch of {task} failed: {source}")]
    Driver {
        task: String,
        #[source]
        source: DriverError,
    },
    #[error("device fault after {task}: {source}")]
    Sync {
        task: String,
        #[source]
        source: DriverError,
    },
}

impl DeviceContext {
    /// Pack `args` and launch `function` on the default stream.
    ///
    /// `args` must be in the kernel's formal-parameter order. `task_name` is
    /// used for profiler labels and error messages.
    pub fn launch(
        &self,
        function: KernelFunction,
        task_name: &str,
        args: &[KernelArg<'_>],
        config: LaunchConfig,
    ) -> Result<(), LaunchError> {
        let shared_mem_bytes = u32::try_from(config.shared_mem_bytes)
            .map_err(|_| LaunchError::SharedMemTooLarge(config.shared_mem_bytes))?;
        let grid = Dim3::linear(config.grid_dim);
        let block = Dim3::linear(config.block_dim);

        let span = self.profiler.as_ref().map(|profiler| {
            let info = TraceInfo {
                function,
                grid,
                block,
                shared_mem_bytes: config.shared_mem_bytes,
            };
            (profiler, profiler.trace(&self.trace_label(task_name), &info))
        });

        let result = self.enqueue(function, task_name, args, grid, block, shared_mem_bytes);

        if let Some((profiler, handle)) = span {
            profiler.stop(handle);
        }
        result?;

        if self.debug {
            self.driver
                .stream_synchronize(StreamHandle::DEFAULT)
                .map_err(|source| LaunchError::Sync {
                    task: task_name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn enqueue(
        &self,
        function: KernelFunction,
        task_name: &str,
        args: &[KernelArg<'_>],
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
    ) -> Result<(), LaunchError> {
        let packed = PackedArgs::pack(args)?;

        if grid.x == 0 {
            trace!("Skipping enqueue of {}: empty grid", task_name);
            return Ok(());
        }

        trace!(
            "Launching {} grid={} block={} args={} ({} bytes, {} padding)",
            task_name,
            grid.x,
            block.x,
            args.len(),
            packed.len(),
            packed.layout().padding()
        );

        let _guard = self.launch_lock.lock();
        let launch = KernelLaunch {
            function,
            grid,
            block,
            shared_mem_bytes,
            stream: StreamHandle::DEFAULT,
            args: packed.as_bytes(),
        };
        self.driver
            .launch_kernel(&launch)
            .map_err(|source| LaunchError::Driver {
                task: task_name.to_string(),
                source,
            })
    }

    /// Profiler label: the primal kernel name when the task name demangles.
    fn trace_label(&self, task_name: &str) -> String {
        self.demangler
            .as_ref()
            .and_then(|demangler| demangler.try_demangle(task_name))
            .map(|demangled| demangled.primal)
            .unwrap_or_else(|| task_name.to_string())
    }
}
