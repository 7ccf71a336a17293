//! Launching a command and measuring it.
//!
//! [`Meter::measure`] spawns the command through a [`ProcessLauncher`], wires
//! its stdout, stderr and timeout into an [`EventMultiplexer`], and hands the
//! merged events to a run loop on its own Tokio task. The caller gets a
//! [`SubProcess`] back immediately: two live line relays plus the single
//! [`RunOutcome`](crate::outcome::RunOutcome) to await.

pub mod command;
pub mod error;
pub mod handle;
pub mod launcher;
pub mod mock;
pub mod multiplex;
pub mod run_loop;
pub mod timeout;


pub use command::{CommandKind, CommandSpec, CommandSpecBuilder};
pub use error::MeasureError;
pub use handle::{LiveLines, SubProcess};
pub use launcher::{ChildExit, ChildHandle, LaunchedProcess, ProcessLauncher, TokioLauncher};
pub use mock::{ProcessScript, ScriptedLauncher};
pub use multiplex::{EventMultiplexer, ProcessEvent};
pub use run_loop::MetricAccumulator;
pub use timeout::timeout_signal;

use std::sync::Arc;

use crate::harvest::Harvesters;
use crate::outcome::MeasureOutput;
use handle::Relay;
use run_loop::{run_loop, RunContext};

#[derive(Clone)]
pub struct Meter {
    launcher: Arc<dyn ProcessLauncher>,
}

impl Meter {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }

    pub fn production() -> Self {
        Self::new(Arc::new(TokioLauncher::default()))
    }

    pub fn launcher(&self) -> Arc<dyn ProcessLauncher> {
        Arc::clone(&self.launcher)
    }

    /// Start measuring `command`.
    ///
    /// Spawn failures are returned here; everything after the spawn resolves
    /// through [`SubProcess::wait`]. Must be called from within a Tokio
    /// runtime.
    pub fn measure(
        &self,
        command: &CommandSpec,
        harvesters: Harvesters,
    ) -> Result<SubProcess, MeasureError> {
        let LaunchedProcess {
            stdout,
            stderr,
            child,
            started_at,
        } = self.launcher.launch(command)?;

        let pid = child.id();
        let events = EventMultiplexer::new(stdout, stderr, timeout_signal(command.timeout));
        let (relay, live_stdout, live_stderr) = Relay::channel();

        let task = tokio::spawn(run_loop(RunContext {
            events,
            child,
            started_at,
            timeout: command.timeout,
            harvesters,
            relay,
        }));

        Ok(SubProcess::new(pid, live_stdout, live_stderr, task))
    }

    /// Measure `command` and keep its full transcript.
    pub async fn measure_and_capture(
        &self,
        command: &CommandSpec,
        harvesters: Harvesters,
    ) -> Result<MeasureOutput, MeasureError> {
        let mut process = self.measure(command, harvesters)?;
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
        let outcome = process.wait().await?;

        Ok(MeasureOutput {
            outcome,
            stdout,
            stderr,
        })
    }
}

async fn collect(lines: Option<LiveLines>) -> Vec<String> {
    match lines {
        Some(lines) => lines.collect_lines().await,
        None => Vec::new(),
    }
}

/// Measure `command` with real processes.
pub fn measure_process(
    command: &CommandSpec,
    harvesters: Harvesters,
) -> Result<SubProcess, MeasureError> {
    Meter::production().measure(command, harvesters)
}
