use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::command::{CommandKind, CommandSpec};
use super::error::MeasureError;

pub type LineItem = Result<String, MeasureError>;
pub type LineStream = Pin<Box<dyn Stream<Item = LineItem> + Send>>;

/// How a child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Success,
    Failure(i32),
}

/// Control over a launched child: wait for it or kill it.
#[async_trait]
pub trait ChildHandle: Send {
    fn id(&self) -> Option<u32>;

    async fn wait(&mut self) -> Result<ChildExit, MeasureError>;

    /// Forcibly terminate the child and reap it.
    async fn terminate(&mut self) -> Result<(), MeasureError>;
}

/// A running child with its output split into line sources.
pub struct LaunchedProcess {
    pub stdout: LineStream,
    pub stderr: LineStream,
    pub child: Box<dyn ChildHandle>,
    /// Taken immediately before the spawn call.
    pub started_at: Instant,
}

pub trait ProcessLauncher: Send + Sync {
    /// Spawn the command. Failing to start is reported here and never as a
    /// run outcome.
    fn launch(&self, command: &CommandSpec) -> Result<LaunchedProcess, MeasureError>;
}

/// Launches real OS processes through `tokio::process`.
///
/// The working directory is handed to the spawn call; the launcher never
/// changes the current directory of this process, so concurrent launches
/// with different directories are safe.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    shell: String,
}

impl Default for TokioLauncher {
    fn default() -> Self {
        let shell = if cfg!(windows) { "cmd" } else { "sh" };
        Self::with_shell(shell)
    }
}

impl TokioLauncher {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Normalize a line by removing trailing newlines
    fn normalize_line(mut line: String) -> String {
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        line
    }

    /// Turn a pipe into a stream of lines.
    ///
    /// Invalid UTF-8 is replaced rather than rejected. A read error is
    /// yielded once and ends the stream.
    fn create_line_stream<R>(reader: BufReader<R>) -> LineStream
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Box::pin(futures::stream::unfold(
            Some(reader),
            |state| async move {
                let Some(mut reader) = state else {
                    return None;
                };
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => None,
                    Ok(_) => {
                        let line = Self::normalize_line(String::from_utf8_lossy(&buf).into_owned());
                        Some((Ok(line), Some(reader)))
                    }
                    Err(e) => Some((Err(MeasureError::Io(e)), None)),
                }
            },
        ))
    }

    fn configure_command(&self, command: &CommandSpec) -> tokio::process::Command {
        let mut cmd = match &command.kind {
            CommandKind::Raw { program, args } => {
                let mut c = tokio::process::Command::new(program);
                c.args(args);
                c
            }
            CommandKind::Shell(script) => {
                let mut c = tokio::process::Command::new(&self.shell);
                if cfg!(windows) {
                    c.arg("/C");
                } else {
                    c.arg("-c");
                }
                c.arg(script);
                c
            }
        };

        // Own process group so a timeout can take down everything the command
        // started, not only the direct child.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        // Inherited environment stays; caller pairs are applied in order so the
        // last one for a key wins.
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn log_command_start(&self, command: &CommandSpec) {
        tracing::debug!("Launching subprocess: {}", command.display());

        if !command.env.is_empty() {
            tracing::debug!("Extra environment variables: {}", command.env.len());
            tracing::trace!("Environment variables: {:?}", command.env);
        }

        if let Some(ref dir) = command.working_dir {
            tracing::debug!("Working directory: {:?}", dir);
        }

        if let Some(timeout) = command.timeout {
            tracing::debug!("Timeout: {:?}", timeout);
        }
    }

    /// Map spawn error to MeasureError
    fn map_spawn_error(error: std::io::Error, command: &CommandSpec) -> MeasureError {
        tracing::error!(
            "Failed to spawn '{}': {:?} (kind: {:?})",
            command.display(),
            error,
            error.kind()
        );

        match (&command.kind, error.kind()) {
            (CommandKind::Raw { program, .. }, std::io::ErrorKind::NotFound) => {
                MeasureError::CommandNotFound(program.clone())
            }
            _ => MeasureError::SpawnFailed {
                command: command.display(),
                source: error,
            },
        }
    }

    /// Extract a stream from a child process, converting None to error
    fn extract_stream<T>(stream: Option<T>, stream_name: &str) -> Result<T, MeasureError> {
        stream.ok_or_else(|| MeasureError::InternalError {
            message: format!("Failed to capture {}", stream_name),
        })
    }

    /// Convert a std ExitStatus to a ChildExit.
    ///
    /// A child killed by a signal reports `128 + signal`, the shell
    /// convention.
    fn convert_exit_status(status: std::process::ExitStatus) -> ChildExit {
        if status.success() {
            return ChildExit::Success;
        }
        if let Some(code) = status.code() {
            return ChildExit::Failure(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildExit::Failure(128 + signal);
            }
        }

        ChildExit::Failure(-1)
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, command: &CommandSpec) -> Result<LaunchedProcess, MeasureError> {
        self.log_command_start(command);

        let mut cmd = self.configure_command(command);
        let started_at = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, command))?;

        let stdout = Self::extract_stream(child.stdout.take(), "stdout")?;
        let stderr = Self::extract_stream(child.stderr.take(), "stderr")?;

        tracing::debug!("Spawned pid {:?}", child.id());

        Ok(LaunchedProcess {
            stdout: Self::create_line_stream(BufReader::new(stdout)),
            stderr: Self::create_line_stream(BufReader::new(stderr)),
            child: Box::new(TokioChild { child }),
            started_at,
        })
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

impl TokioChild {
    #[cfg(unix)]
    fn kill_process_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to kill process group {}: {}", pid, e),
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&self) {}
}

#[async_trait]
impl ChildHandle for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ChildExit, MeasureError> {
        let status = self.child.wait().await?;
        Ok(TokioLauncher::convert_exit_status(status))
    }

    async fn terminate(&mut self) -> Result<(), MeasureError> {
        self.kill_process_group();
        // kill() also reaps, so the pid is gone once this returns.
        self.child.kill().await?;
        Ok(())
    }
}
