//! Blob store abstraction: chunked writers and streaming readers.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use echo_models::{BlobId, VIDEO_CONTENT_TYPE};

use crate::error::{StorageError, StorageResult};

/// Descriptive metadata stored alongside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Media type served back to readers
    pub content_type: String,
    /// Identity the blob belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Display file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Default for BlobMetadata {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            owner: None,
            filename: None,
        }
    }
}

impl BlobMetadata {
    /// Metadata for a rendered video owned by `owner`.
    pub fn video(owner: impl Into<String>) -> Self {
        Self {
            content_type: VIDEO_CONTENT_TYPE.to_string(),
            owner: Some(owner.into()),
            filename: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Information about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub blob_id: BlobId,
    /// Size in bytes
    pub size: u64,
    pub metadata: BlobMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Sink for one blob's chunks.
///
/// Nothing is visible under the blob id until [`BlobWriter::finish`] returns
/// `Ok`. Dropping a writer without finishing discards whatever was staged.
#[async_trait]
pub trait BlobWriter: Send {
    /// Append the next chunk.
    async fn write_chunk(&mut self, chunk: Bytes) -> StorageResult<()>;

    /// Publish all written chunks as one object.
    async fn finish(self: Box<Self>) -> StorageResult<BlobInfo>;

    /// Discard staged data.
    async fn abort(self: Box<Self>) -> StorageResult<()>;

    /// Bytes accepted so far.
    fn bytes_written(&self) -> u64;
}

/// Forward-only stream of a blob's chunks in write order.
pub struct BlobReader {
    info: BlobInfo,
    chunks: BoxStream<'static, StorageResult<Bytes>>,
}

impl BlobReader {
    pub fn new(info: BlobInfo, chunks: BoxStream<'static, StorageResult<Bytes>>) -> Self {
        Self { info, chunks }
    }

    pub fn info(&self) -> &BlobInfo {
        &self.info
    }

    pub fn into_parts(self) -> (BlobInfo, BoxStream<'static, StorageResult<Bytes>>) {
        (self.info, self.chunks)
    }
}

impl Stream for BlobReader {
    type Item = StorageResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx)
    }
}

/// Durable store of binary objects addressed by [`BlobId`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Start writing a blob. An existing blob with the same id is replaced
    /// atomically when the writer finishes.
    async fn create_writer(
        &self,
        blob_id: &BlobId,
        metadata: BlobMetadata,
    ) -> StorageResult<Box<dyn BlobWriter>>;

    /// Open a fresh reader from the first chunk.
    ///
    /// Fails with [`StorageError::NotFound`] when the blob does not exist.
    async fn open_reader(&self, blob_id: &BlobId) -> StorageResult<BlobReader>;

    /// Look up a blob without reading it.
    async fn stat(&self, blob_id: &BlobId) -> StorageResult<Option<BlobInfo>>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, blob_id: &BlobId) -> StorageResult<()>;

    /// Check the backend is reachable.
    async fn check_connectivity(&self) -> StorageResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

pub(crate) fn ensure_valid(blob_id: &BlobId) -> StorageResult<()> {
    if blob_id.is_valid() {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(blob_id.to_string()))
    }
}

/// Write every chunk of `chunks` into a new blob, aborting on the first error.
pub async fn write_stream<S>(
    store: &dyn BlobStore,
    blob_id: &BlobId,
    metadata: BlobMetadata,
    mut chunks: S,
) -> StorageResult<BlobInfo>
where
    S: Stream<Item = StorageResult<Bytes>> + Send + Unpin,
{
    let mut writer = store.create_writer(blob_id, metadata).await?;

    while let Some(chunk) = chunks.next().await {
        let result = match chunk {
            Ok(chunk) => writer.write_chunk(chunk).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Err(abort_err) = writer.abort().await {
                warn!(blob_id = %blob_id, "Failed to abort blob write: {}", abort_err);
            }
            return Err(e);
        }
    }

    writer.finish().await
}

/// Collect a reader into one contiguous buffer.
///
/// Only for callers that genuinely need the whole object at once; fails with
/// [`StorageError::TooLarge`] instead of growing past `max_bytes`.
pub async fn read_to_end(mut reader: BlobReader, max_bytes: u64) -> StorageResult<Bytes> {
    let size = reader.info().size;
    if size > max_bytes {
        return Err(StorageError::TooLarge { limit: max_bytes });
    }

    let mut buf = BytesMut::with_capacity(size as usize);
    while let Some(chunk) = reader.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > max_bytes {
            return Err(StorageError::TooLarge { limit: max_bytes });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Split a buffer into `chunk_size` slices sharing the same allocation.
pub fn split_chunks(data: Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> {
    let chunk_size = chunk_size.max(1);
    let len = data.len();
    (0..len)
        .step_by(chunk_size)
        .map(move |start| data.slice(start..(start + chunk_size).min(len)))
}
