//! Terminal results of a measured run.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::harvest::HarvestValue;

/// Metrics of a run that exited successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    /// Elapsed seconds: self-reported if the command printed `SELFTIMED`,
    /// otherwise wall-clock time from spawn to exit.
    pub realtime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub productivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_footprint: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jit_time: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, HarvestValue>,
}

impl RunMetrics {
    pub fn from_realtime(realtime: f64) -> Self {
        Self {
            realtime,
            productivity: None,
            alloc_rate: None,
            mem_footprint: None,
            jit_time: None,
            custom: BTreeMap::new(),
        }
    }
}

/// Exactly one of these is produced per invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunMetrics),
    ExitError { code: i32 },
    TimedOut,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn metrics(&self) -> Option<&RunMetrics> {
        match self {
            RunOutcome::Completed(metrics) => Some(metrics),
            _ => None,
        }
    }

    pub fn realtime(&self) -> Option<f64> {
        self.metrics().map(|m| m.realtime)
    }

    pub fn productivity(&self) -> Option<f64> {
        self.metrics().and_then(|m| m.productivity)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::ExitError { code } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed(metrics) => {
                write!(f, "completed in {:.3}s", metrics.realtime)?;
                if let Some(pct) = metrics.productivity {
                    write!(f, ", productivity {pct}%")?;
                }
                if let Some(rate) = metrics.alloc_rate {
                    write!(f, ", alloc rate {rate} B/s")?;
                }
                if let Some(bytes) = metrics.mem_footprint {
                    write!(f, ", max residency {bytes} B")?;
                }
                if let Some(jit) = metrics.jit_time {
                    write!(f, ", jit {jit}s")?;
                }
                for (tag, value) in &metrics.custom {
                    write!(f, ", {tag}={value}")?;
                }
                Ok(())
            }
            RunOutcome::ExitError { code } => write!(f, "exited with code {code}"),
            RunOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome plus the full transcript of both streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasureOutput {
    pub outcome: RunOutcome,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_accessors() {
        let mut metrics = RunMetrics::from_realtime(1.5);
        metrics.productivity = Some(90.0);
        let outcome = RunOutcome::Completed(metrics);

        assert!(outcome.is_completed());
        assert_eq!(outcome.realtime(), Some(1.5));
        assert_eq!(outcome.productivity(), Some(90.0));
        assert_eq!(outcome.exit_code(), None);

        let failed = RunOutcome::ExitError { code: 3 };
        assert_eq!(failed.exit_code(), Some(3));
        assert_eq!(failed.metrics(), None);
    }

    #[test]
    fn test_outcome_json_shape() {
        let mut metrics = RunMetrics::from_realtime(2.0);
        metrics
            .custom
            .insert("ITERS".to_string(), HarvestValue::Int(42));
        let json = serde_json::to_value(RunOutcome::Completed(metrics)).unwrap();

        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["realtime"], 2.0);
        assert_eq!(json["custom"]["ITERS"], 42);
        assert!(json.get("productivity").is_none());

        let json = serde_json::to_value(RunOutcome::ExitError { code: 7 }).unwrap();
        assert_eq!(json["outcome"], "exit_error");
        assert_eq!(json["code"], 7);

        let json = serde_json::to_value(RunOutcome::TimedOut).unwrap();
        assert_eq!(json["outcome"], "timed_out");
    }

    #[test]
    fn test_outcome_display() {
        let mut metrics = RunMetrics::from_realtime(0.25);
        metrics.productivity = Some(87.5);
        assert_eq!(
            RunOutcome::Completed(metrics).to_string(),
            "completed in 0.250s, productivity 87.5%"
        );
        assert_eq!(RunOutcome::TimedOut.to_string(), "timed out");
    }
}
