//! Error types for keymirror-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration (or a file it references) could not be read.
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The `password_auth` file is not a `{username, password}` document.
    #[error("failed to parse password auth file at {path}: {source}")]
    PasswordAuth {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A notification `filter` is not a valid regular expression.
    #[error("invalid notification filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: regex::Error,
    },

    /// The document parsed but violates a semantic rule.
    #[error("configuration error: {0}")]
    Invalid(String),
}

pub(crate) fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
