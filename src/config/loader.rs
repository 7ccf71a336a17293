use super::{ConfigError, MeterConfig};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// `<config dir>/procmeter/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "procmeter").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Read and validate `path`, then apply `PROCMETER_*` overrides.
    pub async fn load(path: &Path) -> Result<MeterConfig, ConfigError> {
        let mut config = Self::read_file(path).await?;
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Load the default config file if it exists, otherwise start from
    /// defaults. Environment overrides apply either way.
    pub async fn load_default() -> Result<MeterConfig, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if fs::try_exists(&path).await.unwrap_or(false) => {
                Self::read_file(&path).await?
            }
            _ => MeterConfig::default(),
        };
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    async fn read_file(path: &Path) -> Result<MeterConfig, ConfigError> {
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::ValueKind;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "timeout = \"2s\"\n[[harvest.custom]]\ntag = \"SCORE\"\nkind = \"double\"\n",
        )
        .await
        .unwrap();

        let config = ConfigLoader::read_file(&path).await.unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.harvest.custom[0].kind, ValueKind::Double);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = ConfigLoader::load(&dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "timeout = [").await.unwrap();

        let err = ConfigLoader::read_file(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[tokio::test]
    async fn test_invalid_values_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[[harvest.custom]]\ntag = \"A\"\nkind = \"int\"\n[[harvest.custom]]\ntag = \"A\"\nkind = \"int\"\n",
        )
        .await
        .unwrap();

        let err = ConfigLoader::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
