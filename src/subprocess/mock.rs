use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::command::CommandSpec;
use super::error::MeasureError;
use super::launcher::{ChildExit, ChildHandle, LaunchedProcess, LineStream, ProcessLauncher};

/// One step of a scripted child.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Stdout(String),
    Stderr(String),
    Sleep(Duration),
}

/// What a scripted child prints, how long it takes and how it exits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessScript {
    steps: Vec<ScriptStep>,
    exit_code: i32,
}

impl ProcessScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.steps.push(ScriptStep::Stdout(line.to_string()));
        self
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.steps.push(ScriptStep::Stderr(line.to_string()));
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Sleep(duration));
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }
}

/// A launcher that plays a [`ProcessScript`] instead of spawning a process.
///
/// Records every command it is asked to launch and whether the scripted
/// child was terminated.
#[derive(Clone)]
pub struct ScriptedLauncher {
    script: ProcessScript,
    fail_spawn: bool,
    call_history: Arc<Mutex<Vec<CommandSpec>>>,
    terminated: Arc<AtomicBool>,
}

impl ScriptedLauncher {
    pub fn new(script: ProcessScript) -> Self {
        Self {
            script,
            fail_spawn: false,
            call_history: Arc::new(Mutex::new(Vec::new())),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A launcher whose every launch fails as if the program did not exist.
    pub fn not_found() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new(ProcessScript::new())
        }
    }

    pub fn get_call_history(&self) -> Vec<CommandSpec> {
        self.call_history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, command: &CommandSpec) -> Result<LaunchedProcess, MeasureError> {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(command.clone());
        }

        if self.fail_spawn {
            let program = command
                .program()
                .map_or_else(|| command.display(), str::to_string);
            return Err(MeasureError::CommandNotFound(program));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (err_tx, err_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let script = self.script.clone();
        let started_at = Instant::now();

        let player = tokio::spawn(async move {
            for step in script.steps {
                match step {
                    ScriptStep::Stdout(line) => {
                        let _ = out_tx.send(line);
                    }
                    ScriptStep::Stderr(line) => {
                        let _ = err_tx.send(line);
                    }
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                }
            }
            drop(out_tx);
            drop(err_tx);
            let _ = exit_tx.send(script.exit_code);
        });

        Ok(LaunchedProcess {
            stdout: line_stream(out_rx),
            stderr: line_stream(err_rx),
            child: Box::new(ScriptedChild {
                player,
                exit: Some(exit_rx),
                terminated: Arc::clone(&self.terminated),
            }),
            started_at,
        })
    }
}

fn line_stream(rx: mpsc::UnboundedReceiver<String>) -> LineStream {
    Box::pin(UnboundedReceiverStream::new(rx).map(Ok))
}

struct ScriptedChild {
    player: JoinHandle<()>,
    exit: Option<oneshot::Receiver<i32>>,
    terminated: Arc<AtomicBool>,
}

#[async_trait]
impl ChildHandle for ScriptedChild {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ChildExit, MeasureError> {
        let exit = self.exit.take().ok_or_else(|| MeasureError::InternalError {
            message: "scripted child already waited on".to_string(),
        })?;
        // A terminated script never sends its code; report it like SIGKILL.
        let code = exit.await.unwrap_or(137);
        Ok(if code == 0 {
            ChildExit::Success
        } else {
            ChildExit::Failure(code)
        })
    }

    async fn terminate(&mut self) -> Result<(), MeasureError> {
        self.player.abort();
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}
