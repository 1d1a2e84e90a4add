//! Configuration types shared between xbench crates.

mod constants;
mod document;
mod types;

pub use constants::ModelConstants;
pub use document::{EffectiveConfig, merge};
pub use types::{Framework, Precision};

/// Errors that can occur when loading or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    Parse(String, String),
    #[error("config document must be a key/value mapping, found {0}")]
    NotAMapping(&'static str),
    #[error("missing required config key `{0}`")]
    MissingConfigKey(String),
    #[error("invalid value for config key `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn with_source_path(self, path: &str) -> Self {
        match self {
            Self::Parse(p, msg) if p.is_empty() => Self::Parse(path.to_string(), msg),
            other => other,
        }
    }
}
