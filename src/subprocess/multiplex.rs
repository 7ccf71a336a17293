//! Merging of a child's output and its timer into one event sequence.
//!
//! Two layers. The first merges stdout and stderr lines in arrival order and
//! appends a single `StreamsClosed` once both pipes are exhausted; it knows
//! nothing about the timer, so closing is detected as soon as it happens. The
//! second layer folds that sequence together with the timeout signal and
//! ends right after `StreamsClosed`, so it never waits on a timer once the
//! outcome is being decided.

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use super::error::MeasureError;
use super::launcher::LineStream;
use super::timeout::TimeoutSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    OutLine(String),
    ErrLine(String),
    StreamsClosed,
    TimedOut,
}

pub type EventItem = Result<ProcessEvent, MeasureError>;

/// First layer: both pipes, then `StreamsClosed` exactly once.
fn raw_events(stdout: LineStream, stderr: LineStream) -> BoxStream<'static, EventItem> {
    let out = stdout.map(|line| line.map(ProcessEvent::OutLine));
    let err = stderr.map(|line| line.map(ProcessEvent::ErrLine));

    stream::select(out, err)
        .chain(stream::once(future::ready(Ok(ProcessEvent::StreamsClosed))))
        .boxed()
}

/// Second layer: pipes plus timer.
pub struct EventMultiplexer {
    raw: BoxStream<'static, EventItem>,
    timer: Option<TimeoutSignal>,
    closed: bool,
}

impl EventMultiplexer {
    pub fn new(stdout: LineStream, stderr: LineStream, timer: TimeoutSignal) -> Self {
        Self {
            raw: raw_events(stdout, stderr),
            timer: Some(timer),
            closed: false,
        }
    }

    /// Whether `StreamsClosed` has been yielded.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Stream for EventMultiplexer {
    type Item = EventItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }

        // Timer first, so a chatty child cannot postpone its own timeout.
        if let Some(timer) = this.timer.as_mut() {
            match timer.poll_next_unpin(cx) {
                Poll::Ready(Some(())) => {
                    this.timer = None;
                    return Poll::Ready(Some(Ok(ProcessEvent::TimedOut)));
                }
                Poll::Ready(None) => this.timer = None,
                Poll::Pending => {}
            }
        }

        match this.raw.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(ProcessEvent::StreamsClosed))) => {
                this.closed = true;
                this.timer = None;
                Poll::Ready(Some(Ok(ProcessEvent::StreamsClosed)))
            }
            Poll::Ready(None) => {
                this.closed = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
