//! Configuration for measured runs.
//!
//! Values come from a TOML file, then `PROCMETER_*` environment variables,
//! then command-line flags, each layer overriding the previous one.
//!
//! ```toml
//! timeout = "30s"
//! working_dir = "bench"
//! shell = "bash"
//!
//! [env]
//! RUST_LOG = "warn"
//!
//! [[harvest.custom]]
//! tag = "ITERS"
//! kind = "int"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod loader;

pub use loader::ConfigLoader;

use crate::harvest::{Harvesters, LineHarvester, ValueKind};
use crate::subprocess::{CommandKind, CommandSpec, TokioLauncher};

pub const ENV_TIMEOUT: &str = "PROCMETER_TIMEOUT";
pub const ENV_SHELL: &str = "PROCMETER_SHELL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeterConfig {
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub env: BTreeMap<String, String>,
    pub harvest: HarvestConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    /// Disable the built-in SELFTIMED / productivity / runtime-stat harvesters.
    pub builtin_disabled: bool,
    pub custom: Vec<CustomTag>,
}

/// A caller-chosen tag feeding the custom results table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTag {
    pub tag: String,
    pub kind: ValueKind,
}

impl CustomTag {
    pub fn harvester(&self) -> LineHarvester {
        LineHarvester::tagged(self.tag.clone(), self.kind)
    }
}

impl FromStr for CustomTag {
    type Err = String;

    /// `TAG` (integer) or `TAG:KIND`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, kind) = match s.split_once(':') {
            Some((tag, kind)) => (tag, kind.parse::<ValueKind>()?),
            None => (s, ValueKind::Int),
        };
        if tag.is_empty() {
            return Err(format!("invalid tag {s:?}: tag is empty"));
        }
        Ok(CustomTag {
            tag: tag.to_string(),
            kind,
        })
    }
}

impl MeterConfig {
    pub fn merge_env_vars(&mut self) {
        self.merge_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn merge_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            match humantime_serde::re::humantime::parse_duration(raw.trim()) {
                Ok(timeout) => self.timeout = Some(timeout),
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_TIMEOUT, raw, e),
            }
        }

        if let Some(shell) = lookup(ENV_SHELL) {
            if !shell.trim().is_empty() {
                self.shell = Some(shell);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("timeout must be greater than zero".into()));
        }

        let mut seen = HashSet::new();
        for custom in &self.harvest.custom {
            if custom.tag.is_empty() || custom.tag.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "custom tag {:?} must be a single non-empty token",
                    custom.tag
                )));
            }
            if custom.tag.ends_with(':') {
                return Err(ConfigError::Invalid(format!(
                    "custom tag {:?} must not end with ':'",
                    custom.tag
                )));
            }
            if !seen.insert(custom.tag.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "custom tag {:?} is declared twice",
                    custom.tag
                )));
            }
        }
        Ok(())
    }

    pub fn harvesters(&self) -> Harvesters {
        let base = if self.harvest.builtin_disabled {
            Harvesters::none()
        } else {
            Harvesters::default()
        };
        self.harvest
            .custom
            .iter()
            .fold(base, |h, custom| h.with_custom(custom.harvester()))
    }

    pub fn launcher(&self) -> TokioLauncher {
        match &self.shell {
            Some(shell) => TokioLauncher::with_shell(shell.clone()),
            None => TokioLauncher::default(),
        }
    }

    /// A command with this configuration's environment, timeout and working
    /// directory applied.
    pub fn command(&self, kind: CommandKind) -> CommandSpec {
        CommandSpec {
            kind,
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: self.timeout,
            working_dir: self.working_dir.clone(),
        }
    }
}
