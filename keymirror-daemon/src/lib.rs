//! Mirror daemon: etcd snapshot + watch, notification fan-out, orchestration.

mod error;
pub mod etcd;
pub mod hook;
pub mod keypb;
pub mod notify;
mod runtime;
pub mod store;

pub use error::{DaemonError, HookError, NotifyError, StoreError};
pub use notify::{KeyTransform, NotificationDispatcher, NotificationTarget};
pub use runtime::{
    drive, init_tracing, preview, preview_blocking, run, shutdown_signal, start_blocking,
    sync_filesystem, PipelineHandle, PipelineState, PipelineSummary, Preview, RunSummary,
    SyncFeedback,
};
pub use store::{PrefixSnapshot, StoreClient, StoreConnector, WatchStream};
