//! etcd v3 implementation of the store contract.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, TlsOptions,
    WatchOptions,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use keymirror_core::config::EtcdClientConfig;
use keymirror_core::{EtcdCredentials, KeyRecord};

use crate::error::StoreError;
use crate::store::{
    fold_changes, retry_unavailable, ChangeEvent, PrefixSnapshot, StoreClient, StoreConnector,
    WatchStream,
};

/// Watch batches buffered between the etcd stream and the orchestrator.
const WATCH_BUFFER: usize = 16;

/// Connects to etcd with the TLS and credential settings of the config.
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    config: EtcdClientConfig,
}

impl EtcdConnector {
    pub fn new(config: EtcdClientConfig) -> Self {
        Self { config }
    }

    async fn options(&self) -> Result<ConnectOptions, StoreError> {
        let auth = &self.config.auth;
        let ca = read_credential(Path::new(&auth.ca_cert)).await?;
        let mut tls = TlsOptions::new().ca_certificate(Certificate::from_pem(ca));

        let mut options = ConnectOptions::new()
            .with_connect_timeout(self.config.connection_timeout())
            .with_timeout(self.config.request_timeout());

        match self.config.credentials() {
            EtcdCredentials::ClientCert { cert, key } => {
                let cert = read_credential(&cert).await?;
                let key = read_credential(&key).await?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            EtcdCredentials::Password { username, password } => {
                options = options.with_user(username, password);
            }
        }

        Ok(options.with_tls(tls))
    }
}

#[async_trait]
impl StoreConnector for EtcdConnector {
    async fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        let options = self.options().await?;
        let endpoints: Vec<String> = self
            .config
            .endpoints
            .iter()
            .map(|endpoint| with_scheme(endpoint))
            .collect();

        tracing::info!(?endpoints, "connecting to etcd");
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))?;

        Ok(Box::new(EtcdStore {
            client,
            retries: self.config.retries,
            retry_interval: self.config.retry_interval(),
            request_timeout: self.config.request_timeout(),
        }))
    }
}

/// A connected etcd client.
pub struct EtcdStore {
    client: Client,
    retries: u64,
    retry_interval: Duration,
    request_timeout: Duration,
}

#[async_trait]
impl StoreClient for EtcdStore {
    async fn snapshot(&self, prefix: &str) -> Result<PrefixSnapshot, StoreError> {
        retry_unavailable(self.retries, self.retry_interval, || {
            let mut kv = self.client.kv_client();
            let timeout = self.request_timeout;
            async move {
                let response = tokio::time::timeout(
                    timeout,
                    kv.get(prefix, Some(GetOptions::new().with_prefix())),
                )
                .await
                .map_err(|_| StoreError::Timeout(timeout))??;

                let revision = response.header().map(|h| h.revision()).unwrap_or_default();
                let records = response
                    .kvs()
                    .iter()
                    .map(|kv| {
                        let key = String::from_utf8_lossy(kv.key()).into_owned();
                        let record = KeyRecord {
                            key: key.clone(),
                            value: kv.value().to_vec(),
                            version: kv.version(),
                            create_revision: kv.create_revision(),
                            mod_revision: kv.mod_revision(),
                            lease: kv.lease(),
                        };
                        (key, record)
                    })
                    .collect();

                Ok::<_, StoreError>(PrefixSnapshot { records, revision })
            }
        })
        .await
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: i64,
        cancel: CancellationToken,
    ) -> Result<WatchStream, StoreError> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(prefix, Some(options))
            .await?;

        tracing::info!(prefix, from_revision, "watching prefix");
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };

                let response = match message {
                    Ok(Some(response)) => response,
                    Ok(None) => {
                        let _ = tx
                            .send(Err(StoreError::Watch("watch stream closed by server".into())))
                            .await;
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(StoreError::Watch(err.to_string()))).await;
                        break;
                    }
                };

                if response.canceled() {
                    let reason = format!(
                        "watch cancelled by server (compact revision {}): {}",
                        response.compact_revision(),
                        response.cancel_reason()
                    );
                    let _ = tx.send(Err(StoreError::Watch(reason))).await;
                    break;
                }

                if response.events().is_empty() {
                    continue;
                }

                let revision = response.header().map(|h| h.revision()).unwrap_or_default();
                let events = response.events().iter().filter_map(|event| {
                    let kv = event.kv()?;
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    Some(match event.event_type() {
                        EventType::Put => ChangeEvent::Put {
                            key,
                            value: kv.value().to_vec(),
                        },
                        EventType::Delete => ChangeEvent::Delete { key },
                    })
                });
                let batch = fold_changes(&prefix, revision, events);

                if tx.send(Ok(batch)).await.is_err() {
                    break;
                }
            }

            if let Err(err) = watcher.cancel().await {
                tracing::debug!(error = %err, "failed to cancel etcd watch");
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Closing is by drop: the client holds no server-side session, and the
    /// channel shuts down when the last clone goes away. Always `Ok`.
    async fn close(&self) -> Result<(), StoreError> {
        tracing::debug!("releasing etcd client");
        Ok(())
    }
}

async fn read_credential(path: &Path) -> Result<Vec<u8>, StoreError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| StoreError::Credentials {
            path: path.to_path_buf(),
            source,
        })
}

fn with_scheme(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}
