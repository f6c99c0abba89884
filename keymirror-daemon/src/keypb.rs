//! Wire protocol of the notification stream.
//!
//! `keypb.KeyPushService/SendKeyDiff` is a client-streaming RPC: the client
//! sends one diff as a sequence of [`SendKeyDiffRequest`] chunks and the
//! server answers once with an empty [`SendKeyDiffResponse`]. Every entry of
//! the diff travels in exactly one chunk, whole.
//!
//! The messages are declared with `prost` derives and the client is written
//! directly against `tonic::client::Grpc`, so no code generation step runs.

use std::collections::HashSet;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{IntoStreamingRequest, Response, Status};

use keymirror_core::KeyDiff;

pub const SEND_KEY_DIFF_PATH: &str = "/keypb.KeyPushService/SendKeyDiff";

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendKeyDiffRequest {
    #[prost(message, repeated, tag = "1")]
    pub inserts: Vec<KeyValue>,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<KeyValue>,
    #[prost(string, repeated, tag = "3")]
    pub deletions: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SendKeyDiffResponse {}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeyPushServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl KeyPushServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn send_key_diff(
        &mut self,
        request: impl IntoStreamingRequest<Message = SendKeyDiffRequest>,
    ) -> Result<Response<SendKeyDiffResponse>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|err| Status::unavailable(format!("service was not ready: {err}")))?;
        let path = PathAndQuery::from_static(SEND_KEY_DIFF_PATH);
        self.inner
            .client_streaming(request.into_streaming_request(), path, ProstCodec::default())
            .await
    }
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

fn request_is_empty(request: &SendKeyDiffRequest) -> bool {
    request.inserts.is_empty() && request.updates.is_empty() && request.deletions.is_empty()
}

struct Chunker {
    max: u64,
    current: SendKeyDiffRequest,
    size: u64,
    chunks: Vec<SendKeyDiffRequest>,
}

impl Chunker {
    fn reserve(&mut self, size: u64) {
        if self.size + size > self.max && !request_is_empty(&self.current) {
            self.chunks.push(std::mem::take(&mut self.current));
            self.size = 0;
        }
        self.size += size;
    }
}

/// Split `diff` into chunks whose keys and values total at most
/// `max_chunk_size` bytes. An entry larger than the limit travels alone.
///
/// Inserts come first, then updates, then deletions, each in key order. An
/// empty diff yields no chunk.
pub fn chunk_key_diff(diff: &KeyDiff, max_chunk_size: u64) -> Vec<SendKeyDiffRequest> {
    let mut chunker = Chunker {
        max: max_chunk_size,
        current: SendKeyDiffRequest::default(),
        size: 0,
        chunks: Vec::new(),
    };

    for (key, value) in &diff.inserts {
        chunker.reserve(entry_size(key, value));
        chunker.current.inserts.push(KeyValue {
            key: key.clone(),
            value: value.clone(),
        });
    }
    for (key, value) in &diff.updates {
        chunker.reserve(entry_size(key, value));
        chunker.current.updates.push(KeyValue {
            key: key.clone(),
            value: value.clone(),
        });
    }
    for key in &diff.deletions {
        chunker.reserve(entry_size(key, &[]));
        chunker.current.deletions.push(key.clone());
    }

    if !request_is_empty(&chunker.current) {
        chunker.chunks.push(chunker.current);
    }
    chunker.chunks
}

// ---------------------------------------------------------------------------
// Server-side reassembly
// ---------------------------------------------------------------------------

/// A chunk sequence that does not describe one well-formed diff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("key '{key}' appears more than once in one diff")]
    DuplicateKey { key: String },
}

impl From<ContractViolation> for Status {
    fn from(violation: ContractViolation) -> Self {
        Status::invalid_argument(violation.to_string())
    }
}

/// Rebuilds the [`KeyDiff`] a client streamed, chunk by chunk.
#[derive(Debug, Default)]
pub struct KeyDiffAssembler {
    diff: KeyDiff,
    seen: HashSet<String>,
}

impl KeyDiffAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: SendKeyDiffRequest) -> Result<(), ContractViolation> {
        for entry in chunk.inserts {
            self.claim(&entry.key)?;
            self.diff.inserts.insert(entry.key, entry.value);
        }
        for entry in chunk.updates {
            self.claim(&entry.key)?;
            self.diff.updates.insert(entry.key, entry.value);
        }
        for key in chunk.deletions {
            self.claim(&key)?;
            self.diff.deletions.push(key);
        }
        Ok(())
    }

    pub fn finish(self) -> KeyDiff {
        self.diff
    }

    fn claim(&mut self, key: &str) -> Result<(), ContractViolation> {
        if self.seen.insert(key.to_string()) {
            Ok(())
        } else {
            Err(ContractViolation::DuplicateKey {
                key: key.to_string(),
            })
        }
    }
}

/// Drain a request stream (typically `tonic::Streaming`) into one diff.
pub async fn assemble_stream<S>(mut stream: S) -> Result<KeyDiff, Status>
where
    S: Stream<Item = Result<SendKeyDiffRequest, Status>> + Unpin,
{
    let mut assembler = KeyDiffAssembler::new();
    while let Some(chunk) = stream.next().await {
        assembler.push(chunk?)?;
    }
    Ok(assembler.finish())
}
