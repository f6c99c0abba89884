use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use keymirror_core::{to_value_map, Config, KeyDiff, LogFormat, LogLevel, ValueMap};
use keymirror_sync::{
    apply, ensure_root,
    pipeline::{classify_batch, local_values, mirror_values, reconcile},
    SyncError,
};

use crate::error::{io_err, DaemonError, StoreError};
use crate::etcd::EtcdConnector;
use crate::hook::CommandHook;
use crate::notify::NotificationDispatcher;
use crate::store::{StoreClient, StoreConnector};

/// Diffs in flight between the orchestrator and its caller. One means the
/// orchestrator never runs ahead of the caller by more than a single diff.
const FEEDBACK_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Connecting,
    InitialSync,
    Watching,
    Stopped,
    Failed,
}

/// What the orchestrator reports to its caller.
#[derive(Debug)]
pub enum SyncFeedback {
    /// A diff about to be applied to the mirror.
    Diff(KeyDiff),
    /// The pipeline failed. Always the last message.
    Error(DaemonError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub state: PipelineState,
    pub applied: u64,
}

/// The caller's side of a running pipeline.
pub struct PipelineHandle {
    pub cancel: CancellationToken,
    pub feedback: mpsc::Receiver<SyncFeedback>,
    pub state: watch::Receiver<PipelineState>,
    pub task: JoinHandle<PipelineSummary>,
}

/// Outcome of [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub state: PipelineState,
    pub applied: u64,
    pub notified: u64,
}

/// A dry run: what the pipeline would apply right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub diff: KeyDiff,
    /// Current mirror contents, for rendering updates against.
    pub local: ValueMap,
    pub revision: i64,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Start the mirror and block the current thread until it exits.
pub fn start_blocking(config: Config) -> Result<RunSummary, DaemonError> {
    init_tracing(config.log_level, config.log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the mirror until a signal arrives or the pipeline fails.
///
/// Each diff is pushed to the notification targets before the mirror
/// applies it. A failed push withdraws the go-ahead, so the mirror never
/// gets ahead of the receivers.
pub async fn run(config: Config) -> Result<RunSummary, DaemonError> {
    let config = Arc::new(config);
    let connector: Arc<dyn StoreConnector> =
        Arc::new(EtcdConnector::new(config.etcd_client.clone()));
    let mut dispatcher = NotificationDispatcher::connect(&config.grpc_notifications).await?;
    tracing::info!(
        mirror = %config.filesystem.path.display(),
        prefix = %config.etcd_client.prefix,
        targets = dispatcher.len(),
        "starting keymirror"
    );

    let (proceed_tx, proceed_rx) = mpsc::channel(1);
    let PipelineHandle {
        cancel,
        mut feedback,
        state: _,
        task,
    } = sync_filesystem(config.clone(), connector, Some(proceed_rx));

    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown_signal() => {
                    tracing::info!("received shutdown signal, stopping");
                    cancel.cancel();
                }
            }
        })
    };

    let driven = drive(&mut feedback, &mut dispatcher, Some(proceed_tx)).await;
    cancel.cancel();

    let summary = task
        .await
        .map_err(|err| DaemonError::Join(format!("pipeline task join failure: {err}")))?;
    drop(feedback);
    let _ = signal_handle.await;

    let close_errors = dispatcher.close().await;
    for err in &close_errors {
        tracing::warn!(error = %err, "closing notification target");
    }

    let notified = *driven.as_ref().unwrap_or(&0);
    tracing::info!(
        state = ?summary.state,
        applied = summary.applied,
        notified,
        close_errors = close_errors.len(),
        "keymirror stopped"
    );

    let notified = driven?;
    Ok(RunSummary {
        state: summary.state,
        applied: summary.applied,
        notified,
    })
}

/// Forward every emitted diff to the dispatcher, then release the
/// orchestrator to apply it.
///
/// Returns the number of diffs forwarded once the feedback channel closes.
/// A notification error drops `proceed`, which vetoes the pending apply.
pub async fn drive(
    feedback: &mut mpsc::Receiver<SyncFeedback>,
    dispatcher: &mut NotificationDispatcher,
    proceed: Option<mpsc::Sender<()>>,
) -> Result<u64, DaemonError> {
    let mut notified = 0;
    while let Some(message) = feedback.recv().await {
        match message {
            SyncFeedback::Diff(diff) => {
                if let Err(err) = dispatcher.send(&diff).await {
                    tracing::error!(error = %err, "notification failed, withholding apply");
                    drop(proceed);
                    return Err(err.into());
                }
                notified += 1;
                if let Some(proceed) = &proceed {
                    // A closed go-ahead means the pipeline already stopped.
                    let _ = proceed.send(()).await;
                }
            }
            SyncFeedback::Error(err) => return Err(err),
        }
    }
    Ok(notified)
}

/// Snapshot the store and diff it against the mirror without changing
/// anything.
pub async fn preview(config: &Config) -> Result<Preview, DaemonError> {
    let connector = EtcdConnector::new(config.etcd_client.clone());
    let client = connector.connect().await?;
    let snapshot = client.snapshot(&config.etcd_client.prefix).await;
    if let Err(err) = client.close().await {
        tracing::warn!(error = %err, "closing store client");
    }
    let snapshot = snapshot?;

    let remote = to_value_map(&snapshot.records, &config.etcd_client.prefix);
    let root = config.filesystem.path.clone();
    let (diff, local) = blocking("preview", move || {
        let local = if root.exists() {
            local_values(&root)?
        } else {
            ValueMap::new()
        };
        Ok((keymirror_sync::diff_keys(&mirror_values(&remote), &local), local))
    })
    .await?;

    Ok(Preview {
        diff,
        local,
        revision: snapshot.revision,
    })
}

pub fn preview_blocking(config: &Config) -> Result<Preview, DaemonError> {
    init_tracing(config.log_level, config.log_format);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(preview(config))
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Spawn the mirror pipeline.
///
/// Every non-empty diff is emitted on the feedback channel before it is
/// applied. With `proceed`, the pipeline then waits for one `()` per diff;
/// closing `proceed` stops it without applying. Cancelling the returned
/// token stops it at the next suspension point.
pub fn sync_filesystem(
    config: Arc<Config>,
    connector: Arc<dyn StoreConnector>,
    proceed: Option<mpsc::Receiver<()>>,
) -> PipelineHandle {
    let cancel = CancellationToken::new();
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);
    let (state_tx, state_rx) = watch::channel(PipelineState::Connecting);

    let orchestrator = Orchestrator {
        hook: CommandHook::from_config(&config),
        config,
        connector,
        feedback: feedback_tx,
        proceed,
        state: state_tx,
        cancel: cancel.clone(),
        applied: 0,
    };
    let task = tokio::spawn(orchestrator.run());

    PipelineHandle {
        cancel,
        feedback: feedback_rx,
        state: state_rx,
        task,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Orchestrator {
    config: Arc<Config>,
    connector: Arc<dyn StoreConnector>,
    hook: Option<CommandHook>,
    feedback: mpsc::Sender<SyncFeedback>,
    proceed: Option<mpsc::Receiver<()>>,
    state: watch::Sender<PipelineState>,
    cancel: CancellationToken,
    applied: u64,
}

impl Orchestrator {
    async fn run(mut self) -> PipelineSummary {
        let state = match self.execute().await {
            Ok(()) => PipelineState::Stopped,
            Err(err) => {
                tracing::error!(error = %err, "pipeline failed");
                let report = self.feedback.send(SyncFeedback::Error(err));
                let _ = cancellable(&self.cancel, report).await;
                PipelineState::Failed
            }
        };
        self.set_state(state);
        PipelineSummary {
            state,
            applied: self.applied,
        }
    }

    async fn execute(&mut self) -> Result<(), DaemonError> {
        self.set_state(PipelineState::Connecting);
        let root = self.root();
        let dir_mode = self.config.filesystem.directories_mode;
        blocking("ensure mirror root", move || ensure_root(&root, dir_mode)).await?;

        let connector = self.connector.clone();
        let client = match cancellable(&self.cancel, connector.connect()).await {
            Some(client) => client?,
            None => return Ok(()),
        };

        let result = self.mirror(client.as_ref()).await;
        if let Err(err) = client.close().await {
            tracing::warn!(error = %err, "closing store client");
        }
        result
    }

    async fn mirror(&mut self, client: &dyn StoreClient) -> Result<(), DaemonError> {
        self.set_state(PipelineState::InitialSync);
        let prefix = self.config.etcd_client.prefix.clone();

        let snapshot = match cancellable(&self.cancel, client.snapshot(&prefix)).await {
            Some(snapshot) => snapshot?,
            None => return Ok(()),
        };
        let remote = to_value_map(&snapshot.records, &prefix);
        let root = self.root();
        let diff = blocking("reconcile", move || reconcile(&root, &remote)).await?;
        tracing::info!(
            revision = snapshot.revision,
            changes = diff.len(),
            "reconciled mirror with snapshot"
        );
        if let Flow::Stop = self.deliver(diff).await? {
            return Ok(());
        }

        self.set_state(PipelineState::Watching);
        let watch = client.watch(&prefix, snapshot.revision + 1, self.cancel.child_token());
        let mut batches = match cancellable(&self.cancel, watch).await {
            Some(batches) => batches?,
            None => return Ok(()),
        };

        loop {
            let batch = match cancellable(&self.cancel, batches.next()).await {
                None => return Ok(()),
                Some(None) if self.cancel.is_cancelled() => return Ok(()),
                Some(None) => return Err(StoreError::Watch("watch ended unexpectedly".into()).into()),
                Some(Some(batch)) => batch?,
            };

            let revision = batch.revision;
            let root = self.root();
            let diff = blocking("classify", move || classify_batch(&root, batch)).await?;
            tracing::debug!(revision, changes = diff.len(), "watch batch");
            if let Flow::Stop = self.deliver(diff).await? {
                return Ok(());
            }
        }
    }

    /// Emit, wait for the go-ahead, apply, run the hook.
    async fn deliver(&mut self, diff: KeyDiff) -> Result<Flow, DaemonError> {
        if diff.is_empty() {
            return Ok(Flow::Continue);
        }

        match cancellable(&self.cancel, self.feedback.send(SyncFeedback::Diff(diff.clone()))).await {
            Some(Ok(())) => {}
            Some(Err(_)) => return Err(DaemonError::ChannelClosed("feedback")),
            None => return Ok(Flow::Stop),
        }

        if let Some(proceed) = self.proceed.as_mut() {
            match cancellable(&self.cancel, proceed.recv()).await {
                Some(Some(())) => {}
                Some(None) => {
                    tracing::info!("go-ahead withdrawn, stopping before apply");
                    return Ok(Flow::Stop);
                }
                None => return Ok(Flow::Stop),
            }
        }

        let root = self.root();
        let files_mode = self.config.filesystem.files_mode;
        let dir_mode = self.config.filesystem.directories_mode;
        let outcome = blocking("apply", move || apply(&root, &diff, files_mode, dir_mode)).await?;
        self.applied += 1;
        tracing::info!(
            written = outcome.written,
            deleted = outcome.deleted,
            "applied diff to mirror"
        );

        if let Some(hook) = &self.hook {
            match cancellable(&self.cancel, hook.run()).await {
                Some(result) => result?,
                None => return Ok(Flow::Stop),
            }
        }
        Ok(Flow::Continue)
    }

    fn root(&self) -> PathBuf {
        self.config.filesystem.path.clone()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "pipeline state");
        }
    }
}

/// `None` if `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

async fn blocking<T, F>(task: &'static str, work: F) -> Result<T, DaemonError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| DaemonError::Join(format!("{task} task join error: {err}")))?;
    Ok(result?)
}

// ---------------------------------------------------------------------------
// Process plumbing
// ---------------------------------------------------------------------------

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => wait_on_ctrl_c_error(result).await,
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                wait_on_ctrl_c_error(tokio::signal::ctrl_c().await).await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_on_ctrl_c_error(tokio::signal::ctrl_c().await).await;
}

async fn wait_on_ctrl_c_error(result: std::io::Result<()>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// command output such as `keymirror diff --json`.
pub fn init_tracing(level: LogLevel, format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
