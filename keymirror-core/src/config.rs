//! Typed YAML configuration.
//!
//! # Layout
//!
//! ```yaml
//! filesystem:
//!   path: /opt/configs
//!   files_permission: "0660"
//!   directories_permission: "0770"
//! etcd_client:
//!   prefix: /configs/
//!   endpoints: ["127.0.0.1:2379"]
//!   connection_timeout_in_ms: 10000
//!   request_timeout_in_ms: 10000
//!   retry_interval_in_ms: 100
//!   retries: 10
//!   auth:
//!     ca_cert: /opt/certs/ca.pem
//!     client_cert: /opt/certs/client.pem
//!     client_key: /opt/certs/client.key
//! grpc_notifications:
//!   - endpoint: 127.0.0.1:8080
//!     filter: "^svc/"
//!     trim_key_path: true
//!     max_chunk_size: 1048576
//! notification_command: ["systemctl", "reload", "app"]
//! notification_command_retries: 3
//! log_level: info
//! ```
//!
//! [`load_at`] reads, post-processes (defaults, absolute paths, password
//! file, compiled filters) and validates in one step. Everything downstream
//! consumes the resulting [`Config`] and never touches YAML again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{invalid, ConfigError};

/// Environment variable the CLI consults when no `--config` flag is given.
pub const CONFIG_FILE_ENV: &str = "KEYMIRROR_CONFIG_FILE";
/// Fallback configuration path.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

const DEFAULT_FILES_PERMISSION: &str = "0660";
const DEFAULT_DIRECTORIES_PERMISSION: &str = "0770";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub filesystem: FilesystemConfig,
    pub etcd_client: EtcdClientConfig,
    #[serde(default)]
    pub grpc_notifications: Vec<NotificationConfig>,
    /// Argument vector run after every applied diff. Empty disables the hook.
    #[serde(default)]
    pub notification_command: Vec<String>,
    #[serde(default)]
    pub notification_command_retries: u64,
    #[serde(default = "default_command_retry_interval")]
    pub notification_command_retry_interval_in_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    /// Mirror root. Made absolute on load.
    pub path: PathBuf,
    #[serde(default = "default_files_permission")]
    pub files_permission: String,
    #[serde(default = "default_directories_permission")]
    pub directories_permission: String,
    /// `path` with `/` separators and a trailing `/`.
    #[serde(skip)]
    pub slash_path: String,
    /// Parsed `files_permission`.
    #[serde(skip)]
    pub files_mode: u32,
    /// Parsed `directories_permission`.
    #[serde(skip)]
    pub directories_mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdClientConfig {
    pub prefix: String,
    pub endpoints: Vec<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_in_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,
    /// Delay between attempts when the store reports itself unavailable.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_in_ms: u64,
    #[serde(default)]
    pub retries: u64,
    pub auth: EtcdAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtcdAuthConfig {
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_key: String,
    /// Path to a YAML `{username, password}` file.
    #[serde(default)]
    pub password_auth: String,
    #[serde(skip)]
    pub username: String,
    #[serde(skip)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub endpoint: String,
    /// Regular expression over relative keys. Empty forwards every key.
    #[serde(default)]
    pub filter: String,
    #[serde(skip)]
    pub filter_regex: Option<Regex>,
    /// Send only the last path segment of each key.
    #[serde(default)]
    pub trim_key_path: bool,
    /// Upper bound, in bytes, of the keys and values carried by one chunk.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_in_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,
    #[serde(default)]
    pub auth: GrpcAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrpcAuthConfig {
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[serde(alias = "warning")]
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize)]
struct PasswordAuthFile {
    username: String,
    password: String,
}

/// How the store client authenticates. Exactly one method is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtcdCredentials {
    ClientCert { cert: PathBuf, key: PathBuf },
    Password { username: String, password: String },
}

fn default_files_permission() -> String {
    DEFAULT_FILES_PERMISSION.to_string()
}
fn default_directories_permission() -> String {
    DEFAULT_DIRECTORIES_PERMISSION.to_string()
}
fn default_connection_timeout() -> u64 {
    10_000
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_retry_interval() -> u64 {
    100
}
fn default_max_chunk_size() -> u64 {
    1024 * 1024
}
fn default_command_retry_interval() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Config {
    pub fn notification_command_retry_interval(&self) -> Duration {
        Duration::from_millis(self.notification_command_retry_interval_in_ms)
    }
}

impl EtcdClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_in_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_in_ms)
    }

    /// The authentication method. Only meaningful on a validated config.
    pub fn credentials(&self) -> EtcdCredentials {
        if self.auth.username.is_empty() {
            EtcdCredentials::ClientCert {
                cert: PathBuf::from(&self.auth.client_cert),
                key: PathBuf::from(&self.auth.client_key),
            }
        } else {
            EtcdCredentials::Password {
                username: self.auth.username.clone(),
                password: self.auth.password.clone(),
            }
        }
    }
}

impl NotificationConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_in_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }

    pub fn uses_tls(&self) -> bool {
        !self.auth.ca_cert.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, post-process and validate the configuration at `path`.
pub fn load_at(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    finalize(config)
}

/// Post-process and validate an already-deserialized document.
pub fn finalize(mut config: Config) -> Result<Config, ConfigError> {
    if !config.etcd_client.auth.password_auth.is_empty() {
        let path = PathBuf::from(&config.etcd_client.auth.password_auth);
        let auth = load_password_auth(&path)?;
        config.etcd_client.auth.username = auth.username;
        config.etcd_client.auth.password = auth.password;
    }

    if config.filesystem.path.as_os_str().is_empty() {
        return Err(invalid("Filesystem path cannot be empty"));
    }
    config.filesystem.path = absolute(&config.filesystem.path)?;
    config.filesystem.slash_path = slash_path(&config.filesystem.path);

    for notification in &mut config.grpc_notifications {
        if !notification.filter.is_empty() {
            let regex = Regex::new(&notification.filter).map_err(|source| ConfigError::Filter {
                filter: notification.filter.clone(),
                source,
            })?;
            notification.filter_regex = Some(regex);
        }
    }

    validate(&mut config)?;
    Ok(config)
}

fn load_password_auth(path: &Path) -> Result<PasswordAuthFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::PasswordAuth {
        path: path.to_path_buf(),
        source,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    Ok(cwd.join(path))
}

/// `path` rendered with `/` separators and exactly one trailing `/`.
pub fn slash_path(path: &Path) -> String {
    let mut slashed = path.to_string_lossy().replace('\\', "/");
    if !slashed.ends_with('/') {
        slashed.push('/');
    }
    slashed
}

/// Parse a unix permission string such as `"0660"`.
pub fn parse_permission(value: &str) -> Option<u32> {
    u32::from_str_radix(value, 8).ok().filter(|mode| *mode <= 0o777)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &mut Config) -> Result<(), ConfigError> {
    let etcd = &config.etcd_client;

    if etcd.endpoints.iter().all(|endpoint| endpoint.trim().is_empty()) {
        return Err(invalid("Etcd endpoints cannot be empty"));
    }

    if etcd.auth.ca_cert.is_empty() {
        return Err(invalid("CA certificate path cannot be empty"));
    }

    let auth = &etcd.auth;
    let no_valid_auth = (auth.client_cert.is_empty() || auth.client_key.is_empty())
        && (auth.username.is_empty() || auth.password.is_empty());
    let ambiguous_auth = (!auth.client_cert.is_empty() || !auth.client_key.is_empty())
        && (!auth.username.is_empty() || !auth.password.is_empty());
    if no_valid_auth || ambiguous_auth {
        return Err(invalid(
            "Either user certificate AND key path should not be empty XOR user name AND password should not be empty",
        ));
    }

    if etcd.prefix.is_empty() {
        return Err(invalid("Etcd key prefix cannot be empty"));
    }

    config.filesystem.files_mode = parse_permission(&config.filesystem.files_permission)
        .ok_or_else(|| {
            invalid("Files permission must constitute a valid unix value for file permissions")
        })?;
    config.filesystem.directories_mode =
        parse_permission(&config.filesystem.directories_permission).ok_or_else(|| {
            invalid(
                "Directories permission must constitute a valid unix value for file permissions",
            )
        })?;

    for notification in &config.grpc_notifications {
        if notification.endpoint.trim().is_empty() {
            return Err(invalid("Notification endpoint cannot be empty"));
        }
        if notification.max_chunk_size == 0 {
            return Err(invalid(format!(
                "Notification max_chunk_size must be positive for endpoint {}",
                notification.endpoint
            )));
        }
        if notification.auth.client_cert.is_empty() != notification.auth.client_key.is_empty() {
            return Err(invalid(format!(
                "Notification client certificate and key must be given together for endpoint {}",
                notification.endpoint
            )));
        }
        if !notification.auth.client_cert.is_empty() && notification.auth.ca_cert.is_empty() {
            return Err(invalid(format!(
                "Notification client certificate requires a CA certificate for endpoint {}",
                notification.endpoint
            )));
        }
    }

    if config
        .notification_command
        .first()
        .is_some_and(|program| program.trim().is_empty())
    {
        return Err(invalid("Notification command program cannot be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_parse_as_octal() {
        assert_eq!(parse_permission("0660"), Some(0o660));
        assert_eq!(parse_permission("770"), Some(0o770));
        assert_eq!(parse_permission("0999"), None);
        assert_eq!(parse_permission("1777"), None);
        assert_eq!(parse_permission("rw-"), None);
    }

    #[test]
    fn slash_path_has_single_trailing_slash() {
        assert_eq!(slash_path(Path::new("/opt/configs")), "/opt/configs/");
        assert_eq!(slash_path(Path::new("/opt/configs/")), "/opt/configs/");
    }

    #[test]
    fn log_level_accepts_warning_alias() {
        let level: LogLevel = serde_yaml::from_str("warning").expect("parse");
        assert_eq!(level, LogLevel::Warn);
        assert_eq!(level.as_directive(), "warn");
    }
}
