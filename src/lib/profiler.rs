//! # Kernel profiling
//!
//! The launch path talks to a profiler only through [`KernelProfiler`]: one
//! `trace` call before the enqueue that hands out a [`TaskHandle`], and one
//! `stop` call with that handle afterwards. The backend is chosen when the
//! device context is built.
//!
//! [`WallClockProfiler`] is the built-in backend. It measures host-side time
//! between `trace` and `stop`, which covers packing and the enqueue. The
//! debug-mode stream sync runs after `stop` and is not included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::driver::{Dim3, KernelFunction};

/// Opaque token correlating a `trace` call with its `stop`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// Launch parameters reported to the profiler.
#[derive(Copy, Clone, Debug)]
pub struct TraceInfo {
    pub function: KernelFunction,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: usize,
}

/// A profiler backend.
pub trait KernelProfiler: Send + Sync {
    /// Begin a span for one launch.
    fn trace(&self, label: &str, info: &TraceInfo) -> TaskHandle;

    /// End the span started by `trace`.
    fn stop(&self, handle: TaskHandle);
}

/// One completed span.
#[derive(Clone, Debug, Serialize)]
pub struct TraceRecord {
    pub name: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: usize,
    pub elapsed_us: f64,
}

struct PendingTrace {
    name: String,
    grid: Dim3,
    block: Dim3,
    shared_mem_bytes: usize,
    start: Instant,
}

/// Aggregated time per kernel name.
#[derive(Clone, Debug, Serialize)]
pub struct KernelSummary {
    pub name: String,
    pub launches: u64,
    pub total_us: f64,
    pub max_us: f64,
}

/// Records host wall-clock time per launch.
#[derive(Default)]
pub struct WallClockProfiler {
    next_handle: AtomicU64,
    pending: Mutex<HashMap<TaskHandle, PendingTrace>>,
    records: Mutex<Vec<TraceRecord>>,
}

impl WallClockProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed spans, in completion order.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    /// Spans started but not yet stopped.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Per-kernel totals, sorted by total time descending.
    pub fn summary(&self) -> Vec<KernelSummary> {
        let mut by_name: HashMap<String, KernelSummary> = HashMap::new();
        for record in self.records.lock().iter() {
            let entry = by_name
                .entry(record.name.clone())
                .or_insert_with(|| KernelSummary {
                    name: record.name.clone(),
                    launches: 0,
                    total_us: 0.0,
                    max_us: 0.0,
                });
            entry.launches += 1;
            entry.total_us += record.elapsed_us;
            entry.max_us = entry.max_us.max(record.elapsed_us);
        }
        let mut summary: Vec<_> = by_name.into_values().collect();
        summary.sort_by(|a, b| b.total_us.total_cmp(&a.total_us));
        summary
    }
}

impl KernelProfiler for WallClockProfiler {
    fn trace(&self, label: &str, info: &TraceInfo) -> TaskHandle {
        let handle = TaskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.pending.lock().insert(
            handle,
            PendingTrace {
                name: label.to_string(),
                grid: info.grid,
                block: info.block,
                shared_mem_bytes: info.shared_mem_bytes,
                start: Instant::now(),
            },
        );
        handle
    }

    fn stop(&self, handle: TaskHandle) {
        let Some(pending) = self.pending.lock().remove(&handle) else {
            tracing::warn!("stop called for unknown profiler task {:?}", handle);
            return;
        };
        let elapsed: Duration = pending.start.elapsed();
        self.records.lock().push(TraceRecord {
            name: pending.name,
            grid: pending.grid,
            block: pending.block,
            shared_mem_bytes: pending.shared_mem_bytes,
            elapsed_us: elapsed.as_secs_f64() * 1e6,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(grid: u32) -> TraceInfo {
        TraceInfo {
            function: KernelFunction::from_raw(std::ptr::null_mut()),
            grid: Dim3::linear(grid),
            block: Dim3::linear(128),
            shared_mem_bytes: 0,
        }
    }

    #[test]
    fn test_trace_stop_records_span() {
        let profiler = WallClockProfiler::new();
        let handle = profiler.trace("saxpy", &info(4));
        assert_eq!(profiler.in_flight(), 1);
        profiler.stop(handle);
        assert_eq!(profiler.in_flight(), 0);

        let records = profiler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "saxpy");
        assert_eq!(records[0].grid.x, 4);
        assert!(records[0].elapsed_us >= 0.0);
    }

    #[test]
    fn test_handles_are_distinct() {
        let profiler = WallClockProfiler::new();
        let a = profiler.trace("a", &info(1));
        let b = profiler.trace("b", &info(1));
        assert_ne!(a, b);
        profiler.stop(b);
        profiler.stop(a);
        let names: Vec<_> = profiler.records().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_handle_is_ignored() {
        let profiler = WallClockProfiler::new();
        profiler.stop(TaskHandle(42));
        assert!(profiler.records().is_empty());
    }

    #[test]
    fn test_summary_groups_by_name() {
        let profiler = WallClockProfiler::new();
        for name in ["fill", "reduce", "fill"] {
            let handle = profiler.trace(name, &info(1));
            profiler.stop(handle);
        }
        let summary = profiler.summary();
        assert_eq!(summary.len(), 2);
        let fill = summary.iter().find(|s| s.name == "fill").unwrap();
        assert_eq!(fill.launches, 2);

        profiler.clear();
        assert!(profiler.summary().is_empty());
    }
}
