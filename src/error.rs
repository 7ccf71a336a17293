use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::harvest::HarvestError;
pub use crate::subprocess::MeasureError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Measure(#[from] MeasureError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<HarvestError> for Error {
    fn from(err: HarvestError) -> Self {
        Error::Measure(MeasureError::Harvest(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
