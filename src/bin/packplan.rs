#![deny(missing_docs)]
//! # Packing Planner
//!
//! The `akl-packplan` binary prints where each kernel argument lands in the
//! packed argument buffer for a given list of argument sizes, in kernel
//! parameter order. It needs no GPU and is useful when debugging a kernel
//! that reads garbage from one of its parameters.
//!
//! ```text
//! $ akl-packplan --sizes 4,8,40
//! [PLAN] arg 0: offset 0, size 4
//! [PLAN] arg 1: offset 4, size 8
//! [PLAN] arg 2: offset 32, size 40
//! [PLAN] total 72 bytes (20 padding)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use akl::ArgLayout;

#[derive(Parser, Debug)]
#[command(author, version, about = "Show the packed layout of kernel arguments")]
/// Command-line arguments for the planner.
struct Args {
    /// Argument sizes in bytes, in kernel parameter order
    #[arg(long, value_delimiter = ',', required = true)]
    sizes: Vec<usize>,

    /// Print the layout as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let layout = ArgLayout::compute(args.sizes.iter().copied())
        .context("Argument sizes do not fit in one packed buffer")?;

    if args.json {
        let body = serde_json::to_string_pretty(&layout).context("Failed to serialize layout")?;
        println!("{}", body);
        return Ok(());
    }

    for (i, slot) in layout.slots().iter().enumerate() {
        info!("[PLAN] arg {}: offset {}, size {}", i, slot.offset, slot.size);
    }
    info!(
        "[PLAN] total {} bytes ({} padding)",
        layout.total(),
        layout.padding()
    );

    Ok(())
}
