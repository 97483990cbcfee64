#![deny(missing_docs)]
//! # Device Probe
//!
//! The `akl-probe` binary creates the process-wide AMDGPU device context over
//! `libamdhip64.so` and reports what it found: device name, memory, compute
//! capability, target architecture and which `hipDeviceProp_t` layout the
//! runtime filled. This is the quickest way to check that a ROCm install is
//! usable and that the architecture probe agrees with `rocminfo`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use akl::{ContextConfig, DeviceContext, HipDriver, WallClockProfiler};

const GB: f64 = (1u64 << 30) as f64;

#[derive(Parser, Debug, Serialize)]
#[command(author, version, about = "Probe the AMDGPU device and report its capabilities")]
/// Command-line arguments for the probe.
struct Args {
    /// Synchronize after every launch (debug mode)
    #[arg(long)]
    debug: bool,

    /// Attach the wall-clock profiler
    #[arg(long)]
    profile: bool,

    /// Write the device report and configuration as JSON
    #[arg(long)]
    out: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false) // Don't show module target
        .init();

    info!("[PROBE:INIT] akl {} starting", akl::VERSION);

    let driver = HipDriver::load().context("Failed to load the HIP runtime")?;

    let mut config = ContextConfig::default().with_debug(args.debug);
    if args.profile {
        config = config.with_profiler(Arc::new(WallClockProfiler::new()));
    }

    let ctx = DeviceContext::init_global(Arc::new(driver), config)
        .context("Failed to create AMDGPU device context")?;
    let report = ctx.report().context("Failed to query device")?;

    info!("[PROBE:DEVICE] Name: {}", report.name);
    info!("[PROBE:DEVICE] Devices visible: {}", report.device_count);
    info!(
        "[PROBE:DEVICE] Memory: {:.2} GB free / {:.2} GB total",
        report.memory.free as f64 / GB,
        report.memory.total as f64 / GB
    );
    info!(
        "[PROBE:ARCH] {} (compute capability {}, {:?} property layout)",
        report.mcpu, report.compute_capability, report.props_layout
    );

    if let Some(ref out) = args.out {
        save_report(out, &args, &report)?;
    }

    Ok(())
}

fn save_report(path: &str, args: &Args, report: &akl::DeviceReport) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let results = json!({
        "config": args,
        "device": report,
    });
    let body = serde_json::to_string_pretty(&results).context("Failed to serialize report")?;
    fs::write(path, body).with_context(|| format!("Failed to write report to {}", path))?;
    info!("[PROBE:DONE] Saved report to {}", path);

    Ok(())
}
