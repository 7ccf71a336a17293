use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::error::MeasureError;
use crate::outcome::RunOutcome;

/// Live relay of one output stream of a running command.
///
/// Ends when the run loop closes it: on exit, on timeout, or when the run
/// aborts. Once ended it never yields again.
pub struct LiveLines {
    inner: UnboundedReceiverStream<String>,
}

impl LiveLines {
    pub async fn next_line(&mut self) -> Option<String> {
        self.inner.next().await
    }

    /// Read until the relay is closed.
    pub async fn collect_lines(self) -> Vec<String> {
        self.inner.collect().await
    }
}

impl Stream for LiveLines {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Producer side of the two live relays, owned by the run loop.
pub(crate) struct Relay {
    stdout: Option<mpsc::UnboundedSender<String>>,
    stderr: Option<mpsc::UnboundedSender<String>>,
}

impl Relay {
    pub(crate) fn channel() -> (Relay, LiveLines, LiveLines) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let relay = Relay {
            stdout: Some(out_tx),
            stderr: Some(err_tx),
        };
        (
            relay,
            LiveLines {
                inner: UnboundedReceiverStream::new(out_rx),
            },
            LiveLines {
                inner: UnboundedReceiverStream::new(err_rx),
            },
        )
    }

    // A consumer that dropped its relay just stops receiving.
    pub(crate) fn stdout(&self, line: &str) {
        if let Some(tx) = &self.stdout {
            let _ = tx.send(line.to_string());
        }
    }

    pub(crate) fn stderr(&self, line: &str) {
        if let Some(tx) = &self.stderr {
            let _ = tx.send(line.to_string());
        }
    }

    pub(crate) fn close(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }
}

/// A command being measured.
///
/// The run loop executes on its own task; this handle only observes it. Take
/// the live relays before calling [`SubProcess::wait`] if you want them;
/// relays that are never taken are dropped with the handle.
pub struct SubProcess {
    pid: Option<u32>,
    stdout: Option<LiveLines>,
    stderr: Option<LiveLines>,
    outcome: JoinHandle<Result<RunOutcome, MeasureError>>,
}

impl SubProcess {
    pub(crate) fn new(
        pid: Option<u32>,
        stdout: LiveLines,
        stderr: LiveLines,
        outcome: JoinHandle<Result<RunOutcome, MeasureError>>,
    ) -> Self {
        Self {
            pid,
            stdout: Some(stdout),
            stderr: Some(stderr),
            outcome,
        }
    }

    /// OS process id of the child, if it had one.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<LiveLines> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<LiveLines> {
        self.stderr.take()
    }

    /// Await the single terminal outcome.
    pub async fn wait(self) -> Result<RunOutcome, MeasureError> {
        self.outcome.await.map_err(|e| MeasureError::InternalError {
            message: format!("run loop task failed: {e}"),
        })?
    }
}
