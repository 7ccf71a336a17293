//! # procmeter
//!
//! Run a benchmark command as a child process, relay its output live, and
//! report exactly one outcome: completed with metrics, failed with an exit
//! code, or timed out.
//!
//! ## Usage
//!
//! ```bash
//! procmeter -t 30s --tag ITERS:int -- ./bench --quick
//! ```
//!
//! Metrics come from wall-clock time or from lines the child prints itself
//! (`SELFTIMED <seconds>`, `PRODUCTIVITY <percent>`, runtime GC summaries and
//! caller-chosen tags).
//!
//! ## Modules
//!
//! - `config` - TOML configuration with environment overrides
//! - `error` - Error types shared across the crate
//! - `harvest` - Line harvesters that pull tagged values out of output lines
//! - `outcome` - The result of one measured run
//! - `subprocess` - Launching, multiplexing, timing out and measuring a child
pub mod config;
pub mod error;
pub mod harvest;
pub mod outcome;
pub mod subprocess;

pub use config::{ConfigLoader, MeterConfig};
pub use error::{Error, Result};
pub use harvest::{LineHarvester, Harvesters};
pub use outcome::{MeasureOutput, RunMetrics, RunOutcome};
pub use subprocess::{measure_process, CommandSpec, CommandSpecBuilder, Meter, SubProcess};
