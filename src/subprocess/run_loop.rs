//! The per-invocation event loop: relay, harvest, decide.

use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::error::MeasureError;
use super::handle::Relay;
use super::launcher::{ChildExit, ChildHandle};
use super::multiplex::{EventMultiplexer, ProcessEvent};
use crate::harvest::{HarvestError, HarvestValue, Harvesters, LineHarvester};
use crate::outcome::{RunMetrics, RunOutcome};

/// Upper bound on draining a timed-out child's pipes. Descendants that left
/// the process group can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Metrics seen so far. Each slot is filled by the first match only.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricAccumulator {
    realtime: Option<f64>,
    productivity: Option<f64>,
    alloc_rate: Option<u64>,
    mem_footprint: Option<u64>,
    jit_time: Option<f64>,
    custom: BTreeMap<String, HarvestValue>,
}

impl MetricAccumulator {
    pub fn observe_stdout(
        &mut self,
        line: &str,
        harvesters: &Harvesters,
    ) -> Result<(), HarvestError> {
        record(&mut self.realtime, &harvesters.timing, line, HarvestValue::as_f64)?;
        record(&mut self.jit_time, &harvesters.jit_time, line, HarvestValue::as_f64)?;
        self.observe_runtime_stats(line, harvesters)?;

        for harvester in &harvesters.custom {
            if let Some(found) = harvester.harvest(line)? {
                trace!(tag = %found.tag, value = %found.value, "harvested custom tag");
                self.custom.entry(found.tag).or_insert(found.value);
            }
        }
        Ok(())
    }

    /// Stderr carries runtime statistics only; self-timing is stdout-only.
    pub fn observe_stderr(
        &mut self,
        line: &str,
        harvesters: &Harvesters,
    ) -> Result<(), HarvestError> {
        self.observe_runtime_stats(line, harvesters)
    }

    fn observe_runtime_stats(
        &mut self,
        line: &str,
        harvesters: &Harvesters,
    ) -> Result<(), HarvestError> {
        record(
            &mut self.productivity,
            &harvesters.productivity,
            line,
            HarvestValue::as_f64,
        )?;
        record(
            &mut self.alloc_rate,
            &harvesters.alloc_rate,
            line,
            HarvestValue::as_u64,
        )?;
        record(
            &mut self.mem_footprint,
            &harvesters.mem_footprint,
            line,
            HarvestValue::as_u64,
        )
    }

    /// Final metrics; `measured` is used when the child did not time itself.
    pub fn finish(self, measured: Duration) -> RunMetrics {
        RunMetrics {
            realtime: self.realtime.unwrap_or_else(|| measured.as_secs_f64()),
            productivity: self.productivity,
            alloc_rate: self.alloc_rate,
            mem_footprint: self.mem_footprint,
            jit_time: self.jit_time,
            custom: self.custom,
        }
    }
}

/// Apply `harvester` to `line`; store the value if `slot` is still empty.
///
/// The harvester runs even when the slot is full so malformed repeats are
/// still reported.
fn record<T>(
    slot: &mut Option<T>,
    harvester: &LineHarvester,
    line: &str,
    convert: fn(&HarvestValue) -> Option<T>,
) -> Result<(), HarvestError>
where
    T: std::fmt::Debug,
{
    let Some(found) = harvester.harvest(line)? else {
        return Ok(());
    };
    if slot.is_some() {
        trace!(tag = %found.tag, "ignoring repeated metric");
        return Ok(());
    }
    match convert(&found.value) {
        Some(value) => {
            trace!(tag = %found.tag, ?value, "harvested metric");
            *slot = Some(value);
        }
        None => warn!(
            tag = %found.tag,
            value = %found.value,
            "harvested value has the wrong type for its metric; ignoring"
        ),
    }
    Ok(())
}

pub(crate) struct RunContext {
    pub events: EventMultiplexer,
    pub child: Box<dyn ChildHandle>,
    pub started_at: Instant,
    pub timeout: Option<Duration>,
    pub harvesters: Harvesters,
    pub relay: Relay,
}

/// Consume events until a terminal one, producing the single outcome.
pub(crate) async fn run_loop(ctx: RunContext) -> Result<RunOutcome, MeasureError> {
    let RunContext {
        mut events,
        mut child,
        started_at,
        timeout,
        harvesters,
        mut relay,
    } = ctx;
    // Also bounds the exit wait after both pipes have closed.
    let deadline = timeout.map(|t| tokio::time::Instant::from_std(started_at) + t);
    let mut metrics = MetricAccumulator::default();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "output source failed; treating it as closed");
                continue;
            }
        };

        let observed = match event {
            ProcessEvent::OutLine(line) => {
                relay.stdout(&line);
                metrics.observe_stdout(&line, &harvesters)
            }
            ProcessEvent::ErrLine(line) => {
                relay.stderr(&line);
                metrics.observe_stderr(&line, &harvesters)
            }
            ProcessEvent::StreamsClosed => {
                relay.close();
                let waited = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await,
                    None => Ok(child.wait().await),
                };
                let Ok(exit) = waited else {
                    warn!(pid = ?child.id(), "timeout expired after output closed; terminating child");
                    if let Err(err) = child.terminate().await {
                        warn!(error = %err, "failed to terminate timed-out child");
                    }
                    info!(elapsed = ?started_at.elapsed(), "{}", RunOutcome::TimedOut);
                    return Ok(RunOutcome::TimedOut);
                };
                let exit = exit?;
                let elapsed = started_at.elapsed();
                let outcome = match exit {
                    ChildExit::Success => RunOutcome::Completed(metrics.finish(elapsed)),
                    ChildExit::Failure(code) => {
                        debug!(code, "discarding harvested metrics of failed run");
                        RunOutcome::ExitError { code }
                    }
                };
                info!(pid = ?child.id(), elapsed = ?elapsed, "{}", outcome);
                return Ok(outcome);
            }
            ProcessEvent::TimedOut => {
                relay.close();
                warn!(pid = ?child.id(), "timeout expired; terminating child");
                if let Err(err) = child.terminate().await {
                    warn!(error = %err, "failed to terminate timed-out child");
                }
                drain(&mut events).await;
                info!(elapsed = ?started_at.elapsed(), "{}", RunOutcome::TimedOut);
                return Ok(RunOutcome::TimedOut);
            }
        };

        if let Err(err) = observed {
            relay.close();
            warn!(error = %err, "protocol violation; aborting run");
            if let Err(kill_err) = child.terminate().await {
                warn!(error = %kill_err, "failed to terminate child after protocol violation");
            }
            return Err(err.into());
        }
    }

    Err(MeasureError::InternalError {
        message: "event stream ended without a terminal event".to_string(),
    })
}

/// Discard whatever is still queued after a timeout. Faults are logged,
/// never propagated.
async fn drain(events: &mut EventMultiplexer) {
    let mut discarded = 0usize;
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while let Some(item) = events.next().await {
            match item {
                Ok(_) => discarded += 1,
                Err(err) => warn!(error = %err, "ignoring fault while draining timed-out child"),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            grace = ?DRAIN_GRACE,
            "output still open after termination; abandoning drain"
        );
    }
    debug!(discarded, "drained events of timed-out child");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::launcher::LineStream;
    use crate::subprocess::timeout::timeout_signal;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// A child that exits with `exit`, or never when it is `None`.
    struct StubChild {
        exit: Option<ChildExit>,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChildHandle for StubChild {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<ChildExit, MeasureError> {
            match self.exit {
                Some(exit) => Ok(exit),
                None => futures::future::pending().await,
            }
        }

        async fn terminate(&mut self) -> Result<(), MeasureError> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(
        stdout: LineStream,
        stderr: LineStream,
        exit: Option<ChildExit>,
        timeout: Option<Duration>,
    ) -> (RunContext, Arc<AtomicBool>) {
        let terminated = Arc::new(AtomicBool::new(false));
        let (relay, _, _) = Relay::channel();
        let ctx = RunContext {
            events: EventMultiplexer::new(stdout, stderr, timeout_signal(timeout)),
            child: Box::new(StubChild {
                exit,
                terminated: Arc::clone(&terminated),
            }),
            started_at: Instant::now(),
            timeout,
            harvesters: Harvesters::default(),
            relay,
        };
        (ctx, terminated)
    }

    fn broken_pipe() -> MeasureError {
        MeasureError::Io(std::io::Error::other("pipe broke"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_applies_after_output_closed() {
        let (ctx, terminated) = context(
            Box::pin(stream::empty()),
            Box::pin(stream::empty()),
            None,
            Some(Duration::from_secs(1)),
        );

        let outcome = run_loop(ctx).await.unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_before_deadline_completes() {
        let (ctx, terminated) = context(
            Box::pin(stream::iter(vec![Ok("SELFTIMED 0.5".to_string())])),
            Box::pin(stream::empty()),
            Some(ChildExit::Success),
            Some(Duration::from_secs(1)),
        );

        let outcome = run_loop(ctx).await.unwrap();

        assert_eq!(outcome.realtime(), Some(0.5));
        assert!(!terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_faults_do_not_block_timeout() {
        // One fault before the timer fires, one while draining.
        let late_fault: LineStream = Box::pin(stream::once(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(broken_pipe())
        }));
        let early_fault: LineStream = Box::pin(stream::iter(vec![Err(broken_pipe())]));
        let (ctx, terminated) = context(
            late_fault,
            early_fault,
            None,
            Some(Duration::from_millis(10)),
        );

        let outcome = run_loop(ctx).await.unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_on_pipe_held_open() {
        // The sender outlives the run, like a descendant that escaped the
        // process group and still holds stdout.
        let (_holder, rx) = mpsc::unbounded_channel::<String>();
        let held_open: LineStream = Box::pin(UnboundedReceiverStream::new(rx).map(Ok));
        let (ctx, _) = context(
            held_open,
            Box::pin(stream::empty()),
            None,
            Some(Duration::from_secs(1)),
        );
        let start = tokio::time::Instant::now();

        let outcome = run_loop(ctx).await.unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(1) + DRAIN_GRACE);
    }

    #[test]
    fn test_first_match_wins() {
        let harvesters = Harvesters::default();
        let mut acc = MetricAccumulator::default();

        acc.observe_stdout("SELFTIMED 1.5", &harvesters).unwrap();
        acc.observe_stdout("SELFTIMED 9.0", &harvesters).unwrap();

        let metrics = acc.finish(Duration::from_secs(100));
        assert_eq!(metrics.realtime, 1.5);
    }

    #[test]
    fn test_wall_clock_when_not_self_timed() {
        let acc = MetricAccumulator::default();
        let metrics = acc.finish(Duration::from_millis(2500));
        assert_eq!(metrics.realtime, 2.5);
        assert_eq!(metrics.productivity, None);
    }

    #[test]
    fn test_selftimed_ignored_on_stderr() {
        let harvesters = Harvesters::default();
        let mut acc = MetricAccumulator::default();

        acc.observe_stderr("SELFTIMED 1.5", &harvesters).unwrap();
        acc.observe_stderr("PRODUCTIVITY: 80", &harvesters).unwrap();

        let metrics = acc.finish(Duration::from_secs(2));
        assert_eq!(metrics.realtime, 2.0);
        assert_eq!(metrics.productivity, Some(80.0));
    }

    #[test]
    fn test_repeated_malformed_line_still_fails() {
        let harvesters = Harvesters::default();
        let mut acc = MetricAccumulator::default();

        acc.observe_stdout("SELFTIMED 1.5", &harvesters).unwrap();
        assert!(acc.observe_stdout("SELFTIMED oops", &harvesters).is_err());
    }

    #[test]
    fn test_custom_tags_first_match_per_tag() {
        let harvesters = Harvesters::none()
            .with_custom(LineHarvester::custom_int("ITERS"))
            .with_custom(LineHarvester::custom_string("MODE"));
        let mut acc = MetricAccumulator::default();

        acc.observe_stdout("ITERS: 42", &harvesters).unwrap();
        acc.observe_stdout("MODE fast", &harvesters).unwrap();
        acc.observe_stdout("ITERS: 7", &harvesters).unwrap();
        // Custom tags are stdout-only.
        acc.observe_stderr("MODE slow", &harvesters).unwrap();

        let metrics = acc.finish(Duration::ZERO);
        assert_eq!(metrics.custom.get("ITERS"), Some(&HarvestValue::Int(42)));
        assert_eq!(
            metrics.custom.get("MODE"),
            Some(&HarvestValue::Text("fast".to_string()))
        );
    }

    #[test]
    fn test_text_harvester_in_numeric_role_is_ignored() {
        let harvesters = Harvesters::none().with_timing(LineHarvester::custom_string("SELFTIMED"));
        let mut acc = MetricAccumulator::default();

        acc.observe_stdout("SELFTIMED soon", &harvesters).unwrap();
        assert_eq!(acc.finish(Duration::from_secs(1)).realtime, 1.0);
    }

    #[test]
    fn test_runtime_stats_from_stderr() {
        let harvesters = Harvesters::default();
        let mut acc = MetricAccumulator::default();

        acc.observe_stderr("  Alloc rate    1,000 bytes per MUT second", &harvesters)
            .unwrap();
        acc.observe_stderr("  2,048 bytes maximum residency (1 sample(s))", &harvesters)
            .unwrap();
        acc.observe_stdout("JITTIME 0.5", &harvesters).unwrap();

        let metrics = acc.finish(Duration::ZERO);
        assert_eq!(metrics.alloc_rate, Some(1000));
        assert_eq!(metrics.mem_footprint, Some(2048));
        assert_eq!(metrics.jit_time, Some(0.5));
    }
}
