//! Notification dispatcher: pushes each diff to every configured receiver.
//!
//! Targets are served one after the other and the first failure aborts the
//! whole send. Later targets miss that diff; the pipeline stops and a restart
//! re-sends from a fresh snapshot.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};

use keymirror_core::{KeyDiff, NotificationConfig};

use crate::error::NotifyError;
use crate::keypb::{chunk_key_diff, KeyPushServiceClient, SendKeyDiffRequest};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One connection to a notification receiver.
#[async_trait]
pub trait KeyPushTransport: Send {
    /// Stream `chunks` as one upload and wait for the acknowledgment.
    async fn send(&mut self, chunks: Vec<SendKeyDiffRequest>) -> Result<(), NotifyError>;

    async fn close(&mut self) -> Result<(), NotifyError>;
}

/// gRPC transport over a lazily connected tonic channel.
pub struct GrpcTransport {
    endpoint: String,
    client: Option<KeyPushServiceClient>,
}

impl GrpcTransport {
    pub async fn connect(config: &NotificationConfig) -> Result<Self, NotifyError> {
        let scheme = if config.uses_tls() { "https" } else { "http" };
        let uri = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("{scheme}://{}", config.endpoint)
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|err| NotifyError::Endpoint {
                endpoint: config.endpoint.clone(),
                reason: err.to_string(),
            })?
            .connect_timeout(config.connection_timeout())
            .timeout(config.request_timeout());

        if config.uses_tls() {
            endpoint = endpoint
                .tls_config(tls_config(config).await?)
                .map_err(|err| NotifyError::Tls {
                    endpoint: config.endpoint.clone(),
                    reason: err.to_string(),
                })?;
        }

        tracing::debug!(endpoint = %config.endpoint, tls = config.uses_tls(), "notification channel ready");
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client: Some(KeyPushServiceClient::new(endpoint.connect_lazy())),
        })
    }
}

async fn tls_config(config: &NotificationConfig) -> Result<ClientTlsConfig, NotifyError> {
    let auth = &config.auth;
    let ca = read_credential(Path::new(&auth.ca_cert)).await?;
    let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));
    if !auth.client_cert.is_empty() {
        let cert = read_credential(Path::new(&auth.client_cert)).await?;
        let key = read_credential(Path::new(&auth.client_key)).await?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    Ok(tls)
}

async fn read_credential(path: &Path) -> Result<Vec<u8>, NotifyError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| NotifyError::Credentials {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl KeyPushTransport for GrpcTransport {
    async fn send(&mut self, chunks: Vec<SendKeyDiffRequest>) -> Result<(), NotifyError> {
        let client = self.client.as_mut().ok_or_else(|| NotifyError::Transport {
            endpoint: self.endpoint.clone(),
            reason: "connection already closed".to_string(),
        })?;
        client
            .send_key_diff(futures::stream::iter(chunks))
            .await
            .map_err(|status| NotifyError::Status {
                endpoint: self.endpoint.clone(),
                status,
            })?;
        Ok(())
    }

    /// Closing is by drop: the lazy channel is released with the client, so
    /// this never fails.
    async fn close(&mut self) -> Result<(), NotifyError> {
        self.client = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Key rewrite applied before a diff leaves for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyTransform {
    #[default]
    Identity,
    /// Keep only the last `/`-separated segment.
    TrimPath,
}

impl KeyTransform {
    pub fn apply(self, key: &str) -> String {
        match self {
            KeyTransform::Identity => key.to_string(),
            KeyTransform::TrimPath => match key.rfind('/') {
                Some(idx) => key[idx + 1..].to_string(),
                None => key.to_string(),
            },
        }
    }
}

pub struct NotificationTarget {
    endpoint: String,
    transport: Box<dyn KeyPushTransport>,
    filter: Option<Regex>,
    transform: KeyTransform,
    max_chunk_size: u64,
}

impl NotificationTarget {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Box<dyn KeyPushTransport>,
        filter: Option<Regex>,
        transform: KeyTransform,
        max_chunk_size: u64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            filter,
            transform,
            max_chunk_size,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The diff as this target sees it: filtered, then rewritten.
    pub fn prepare(&self, diff: &KeyDiff) -> KeyDiff {
        let filtered = match &self.filter {
            Some(filter) => diff.filter_keys(|key| filter.is_match(key)),
            None => diff.clone(),
        };
        match self.transform {
            KeyTransform::Identity => filtered,
            transform => filtered.transform_keys(|key| transform.apply(key)),
        }
    }

    /// Returns whether anything was sent.
    async fn send(&mut self, diff: &KeyDiff) -> Result<bool, NotifyError> {
        let diff = self.prepare(diff);
        if diff.is_empty() {
            return Ok(false);
        }
        let chunks = chunk_key_diff(&diff, self.max_chunk_size);
        tracing::debug!(
            endpoint = %self.endpoint,
            entries = diff.len(),
            chunks = chunks.len(),
            "pushing diff"
        );
        self.transport.send(chunks).await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NotificationDispatcher {
    targets: Vec<NotificationTarget>,
}

impl NotificationDispatcher {
    pub fn new(targets: Vec<NotificationTarget>) -> Self {
        Self { targets }
    }

    /// Open a transport per configured receiver. On failure the transports
    /// opened so far are closed again.
    pub async fn connect(configs: &[NotificationConfig]) -> Result<Self, NotifyError> {
        let mut dispatcher = Self::default();
        for config in configs {
            let transport = match GrpcTransport::connect(config).await {
                Ok(transport) => transport,
                Err(err) => {
                    for close_err in dispatcher.close().await {
                        tracing::warn!(error = %close_err, "closing notification target");
                    }
                    return Err(err);
                }
            };
            let transform = if config.trim_key_path {
                KeyTransform::TrimPath
            } else {
                KeyTransform::Identity
            };
            dispatcher.targets.push(NotificationTarget::new(
                config.endpoint.clone(),
                Box::new(transport),
                config.filter_regex.clone(),
                transform,
                config.max_chunk_size,
            ));
        }
        Ok(dispatcher)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Push `diff` to every target in order, stopping at the first error.
    pub async fn send(&mut self, diff: &KeyDiff) -> Result<(), NotifyError> {
        for target in &mut self.targets {
            if target.send(diff).await? {
                tracing::info!(endpoint = %target.endpoint, "notified");
            }
        }
        Ok(())
    }

    /// Close every target, collecting all close errors.
    pub async fn close(&mut self) -> Vec<NotifyError> {
        let mut errors = Vec::new();
        for target in &mut self.targets {
            if let Err(err) = target.transport.close().await {
                errors.push(err);
            }
        }
        self.targets.clear();
        errors
    }
}
