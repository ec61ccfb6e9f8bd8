//! Storage backend contract.
//!
//! A [`StorageBackend`] is bound to the URI of one physical object and knows
//! nothing about buckets or versions. Writes go through a [`WriteSink`]: bytes
//! are only visible once the sink is committed, and a sink dropped before
//! commit removes whatever it staged. [`save`] and [`update`] drive a sink
//! from a byte stream while counting and hashing incrementally.

pub mod fs;
pub mod memory;
pub mod registry;

pub use registry::{BackendFactory, BackendRegistry};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, io, pin::Pin, str::FromStr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size used when streaming objects through a hash (5 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no bytes stored at `{0}`")]
    NotFound(String),
    #[error("storage backend `{0}` is not registered")]
    UnknownBackend(String),
    #[error("invalid storage uri `{0}`")]
    InvalidUri(String),
    #[error("expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("stream exceeds the limit of {limit} bytes")]
    LimitExceeded { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Hash function used for file checksums. Checksums are rendered as
/// `<name>:<lowercase hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    pub fn checksummer(&self) -> Checksummer {
        match self {
            Self::Md5 => Checksummer::Md5(Context::new()),
            Self::Sha256 => Checksummer::Sha256(Sha256::new()),
        }
    }

    /// Algorithm named by the prefix of a stored checksum string.
    pub fn of_checksum(checksum: &str) -> Option<Self> {
        checksum.split_once(':').and_then(|(algo, _)| algo.parse().ok())
    }

    /// Checksum of an in-memory buffer.
    pub fn digest(&self, data: &[u8]) -> String {
        let mut checksummer = self.checksummer();
        checksummer.update(data);
        checksummer.finalize()
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(format!("unsupported checksum algorithm `{}`", other)),
        }
    }
}

/// Running hash state.
pub enum Checksummer {
    Md5(Context),
    Sha256(Sha256),
}

impl Checksummer {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(chunk),
            Self::Sha256(hasher) => hasher.update(chunk),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            Self::Md5(ctx) => format!("md5:{:x}", ctx.compute()),
            Self::Sha256(hasher) => format!("sha256:{}", hex::encode(hasher.finalize())),
        }
    }
}

/// Hash a reader in `chunk_size` pieces, stopping after `limit` bytes when
/// given. Returns the number of bytes read and the checksum.
pub async fn hash_reader<R>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
    limit: Option<u64>,
) -> io::Result<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut checksummer = algorithm.checksummer();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;
    loop {
        let want = match limit {
            Some(limit) => {
                let remaining = limit - total;
                if remaining == 0 {
                    break;
                }
                buf.len().min(remaining as usize)
            }
            None => buf.len(),
        };
        let read = reader.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        checksummer.update(&buf[..read]);
        total += read as u64;
    }
    Ok((total, checksummer.finalize()))
}

/// Scoped writable sink handed out by a backend.
///
/// Nothing written is considered durable until [`WriteSink::commit`] returns.
/// Implementations release their resources, and remove staged bytes where the
/// medium allows it, when dropped uncommitted.
#[async_trait]
pub trait WriteSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> BackendResult<()>;

    async fn commit(self: Box<Self>) -> BackendResult<()>;
}

/// Size and checksum observed while writing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub size: u64,
    pub checksum: String,
}

/// Uniform interface over one physical object.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// URI this backend is bound to.
    fn uri(&self) -> &str;

    fn algorithm(&self) -> ChecksumAlgorithm;

    /// Open the object for reading.
    async fn open(&self) -> BackendResult<BoxReader>;

    /// Open the object positioned at `offset`.
    async fn open_at(&self, offset: u64) -> BackendResult<BoxReader> {
        let mut reader = self.open().await?;
        let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
        if skipped < offset {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "offset beyond end of object",
            )));
        }
        Ok(reader)
    }

    /// Reserve space for `size` bytes. May return a relocated URI.
    async fn initialize(&self, size: u64) -> BackendResult<Option<String>>;

    /// Sink replacing the whole object on commit.
    async fn get_save_stream(&self) -> BackendResult<Box<dyn WriteSink>>;

    /// Sink overwriting the object in place starting at `offset`.
    async fn update_stream(&self, offset: u64) -> BackendResult<Box<dyn WriteSink>>;

    /// Remove the physical bytes. Deleting a missing object succeeds.
    async fn delete(&self) -> BackendResult<()>;

    /// Stream the object through the checksum algorithm.
    async fn checksum(&self, chunk_size: usize) -> BackendResult<String> {
        let mut reader = self.open().await?;
        let (_, checksum) = hash_reader(&mut reader, self.algorithm(), chunk_size, None).await?;
        Ok(checksum)
    }
}

/// Copy `stream` into `sink`, enforcing `expected` size and `limit`.
///
/// The sink is only committed when every check passes; any early return drops
/// it uncommitted.
pub async fn write_stream<S>(
    mut sink: Box<dyn WriteSink>,
    stream: S,
    algorithm: ChecksumAlgorithm,
    expected: Option<u64>,
    limit: Option<u64>,
) -> BackendResult<WriteOutcome>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut checksummer = algorithm.checksummer();
    let mut written: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if let Some(limit) = limit {
            if written > limit {
                return Err(BackendError::LimitExceeded { limit });
            }
        }
        if let Some(expected) = expected {
            if written > expected {
                return Err(BackendError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }
        checksummer.update(&chunk);
        sink.write_chunk(&chunk).await?;
    }

    if let Some(expected) = expected {
        if written != expected {
            return Err(BackendError::SizeMismatch {
                expected,
                actual: written,
            });
        }
    }

    sink.commit().await?;
    Ok(WriteOutcome {
        size: written,
        checksum: checksummer.finalize(),
    })
}

/// Replace the backend's object with `stream`.
pub async fn save<S>(
    backend: &dyn StorageBackend,
    stream: S,
    expected: Option<u64>,
    limit: Option<u64>,
) -> BackendResult<WriteOutcome>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let sink = backend.get_save_stream().await?;
    write_stream(sink, stream, backend.algorithm(), expected, limit).await
}

/// Overwrite part of the backend's object starting at `offset`.
pub async fn update<S>(
    backend: &dyn StorageBackend,
    offset: u64,
    stream: S,
    expected: Option<u64>,
) -> BackendResult<WriteOutcome>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let sink = backend.update_stream(offset).await?;
    write_stream(sink, stream, backend.algorithm(), expected, None).await
}

/// Wrap an in-memory buffer as a single-chunk byte stream.
pub fn bytes_stream(data: impl Into<Bytes>) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::once(futures::future::ready(Ok(data.into())))
}
