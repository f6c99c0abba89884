//! # keymirror-sync
//!
//! The blocking, filesystem-facing half of the mirror: the diff engine, the
//! filesystem applier and the reconcile steps shared by the CLI and the
//! daemon.
//!
//! Call [`pipeline::reconcile`] to diff a store snapshot against the mirror,
//! [`pipeline::classify_batch`] to turn a watch batch into a diff, and
//! [`writer::apply`] to make the mirror match.

pub mod diff;
pub mod error;
pub mod pipeline;
pub mod writer;

pub use diff::{diff_keys, unified_value_diff};
pub use error::SyncError;
pub use writer::{apply, ensure_root, scan, ApplyOutcome};
