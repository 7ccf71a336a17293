use crate::harvest::HarvestError;

/// Hard failures of a measurement.
///
/// Non-zero exits and timeouts are not errors; they resolve to a
/// [`RunOutcome`](crate::outcome::RunOutcome).
#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Output protocol violated: {0}")]
    Harvest(#[from] HarvestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl MeasureError {
    /// The child never started.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            MeasureError::CommandNotFound(_) | MeasureError::SpawnFailed { .. }
        )
    }

    /// A harvested line carried a malformed payload.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, MeasureError::Harvest(_))
    }
}
