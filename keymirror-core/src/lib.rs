//! keymirror core library: domain types, typed configuration, errors.
//!
//! - [`types`]: key records, value maps and [`KeyDiff`]
//! - [`config`]: the YAML configuration consumed by every other crate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, EtcdCredentials, LogFormat, LogLevel, NotificationConfig};
pub use error::ConfigError;
pub use types::{to_value_map, KeyDiff, KeyRecord, KeyRecords, ValueMap, WatchBatch};
