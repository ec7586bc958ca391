//! Local filesystem blob store.
//!
//! Layout under the root directory:
//! - `blobs/<id>`            published blob
//! - `staging/<id>.<uuid>`   in-progress writes
//!
//! Each blob is one file: a big-endian `u32` header length, the JSON
//! metadata, then the data. A write streams into a staging file and is
//! published by a single `rename`, so a blob is either absent or complete,
//! and metadata can never be paired with another write's data.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use echo_models::BlobId;

use crate::error::{StorageError, StorageResult};
use crate::store::{ensure_valid, BlobInfo, BlobMetadata, BlobReader, BlobStore, BlobWriter};

/// Default size of chunks produced by readers.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound on the encoded metadata header.
const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Blob store backed by a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    blobs_dir: PathBuf,
    staging_dir: PathBuf,
    read_chunk_size: usize,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating directories as needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let blobs_dir = root.join("blobs");
        let staging_dir = root.join("staging");

        fs::create_dir_all(&blobs_dir).await?;
        fs::create_dir_all(&staging_dir).await?;

        info!("Opened filesystem blob store at {}", root.display());

        Ok(Self {
            blobs_dir,
            staging_dir,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        })
    }

    /// Set the size of chunks produced by readers.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    fn blob_path(&self, blob_id: &BlobId) -> PathBuf {
        self.blobs_dir.join(blob_id.as_str())
    }

    /// Open a published blob and read its header. The returned file is
    /// positioned at the first data byte.
    async fn open_blob(&self, blob_id: &BlobId) -> StorageResult<Option<(File, BlobInfo)>> {
        let mut file = match File::open(self.blob_path(blob_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let fs_meta = file.metadata().await?;

        let header_len = file.read_u32().await?;
        if header_len > MAX_HEADER_LEN {
            return Err(StorageError::download_failed(format!(
                "blob {} has a corrupt header ({} bytes)",
                blob_id, header_len
            )));
        }
        let mut header = vec![0u8; header_len as usize];
        file.read_exact(&mut header).await?;
        let metadata: BlobMetadata = serde_json::from_slice(&header)?;

        let prefix = 4 + u64::from(header_len);
        let info = BlobInfo {
            blob_id: blob_id.clone(),
            size: fs_meta.len().saturating_sub(prefix),
            metadata,
            created_at: fs_meta.modified().ok().map(DateTime::<Utc>::from),
        };
        Ok(Some((file, info)))
    }
}

fn encode_header(metadata: &BlobMetadata) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(metadata)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or_else(|| StorageError::upload_failed("blob metadata too large"))?;

    let mut header = Vec::with_capacity(4 + json.len());
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(&json);
    Ok(header)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create_writer(
        &self,
        blob_id: &BlobId,
        metadata: BlobMetadata,
    ) -> StorageResult<Box<dyn BlobWriter>> {
        ensure_valid(blob_id)?;

        let header = encode_header(&metadata)?;
        let staging = self
            .staging_dir
            .join(format!("{}.{}", blob_id.as_str(), Uuid::new_v4()));
        let mut file = File::create(&staging).await?;

        let mut writer = FsBlobWriter {
            blob_id: blob_id.clone(),
            metadata,
            file: None,
            staging,
            final_path: self.blob_path(blob_id),
            blobs_dir: self.blobs_dir.clone(),
            written: 0,
            done: false,
        };
        // On error the writer drops here and removes the staging file.
        file.write_all(&header).await?;
        writer.file = Some(file);

        debug!(blob_id = %blob_id, "Staging blob write at {}", writer.staging.display());
        Ok(Box::new(writer))
    }

    async fn open_reader(&self, blob_id: &BlobId) -> StorageResult<BlobReader> {
        ensure_valid(blob_id)?;

        let (file, info) = self
            .open_blob(blob_id)
            .await?
            .ok_or_else(|| StorageError::not_found(blob_id.as_str()))?;
        let chunk_size = self.read_chunk_size;

        let chunks = stream::unfold(Some(file), move |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; chunk_size];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(file)))
                }
                Err(e) => Some((Err(StorageError::Io(e)), None)),
            }
        })
        .boxed();

        Ok(BlobReader::new(info, chunks))
    }

    async fn stat(&self, blob_id: &BlobId) -> StorageResult<Option<BlobInfo>> {
        ensure_valid(blob_id)?;
        Ok(self.open_blob(blob_id).await?.map(|(_, info)| info))
    }

    async fn delete(&self, blob_id: &BlobId) -> StorageResult<()> {
        ensure_valid(blob_id)?;

        match fs::remove_file(self.blob_path(blob_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::delete_failed(e.to_string())),
        }
        debug!(blob_id = %blob_id, "Deleted blob");
        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.blobs_dir).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StorageError::config_error(format!(
                "{} is not a directory",
                self.blobs_dir.display()
            )))
        }
    }

    fn backend_name(&self) -> &'static str {
        "fs"
    }
}

/// Writer staging one blob on disk.
struct FsBlobWriter {
    blob_id: BlobId,
    metadata: BlobMetadata,
    file: Option<File>,
    staging: PathBuf,
    final_path: PathBuf,
    blobs_dir: PathBuf,
    written: u64,
    done: bool,
}

impl FsBlobWriter {
    async fn publish(&mut self) -> StorageResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::upload_failed("writer already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.staging, &self.final_path).await?;

        // Persist the directory entry; not every platform supports this.
        if let Ok(dir) = File::open(&self.blobs_dir).await {
            let _ = dir.sync_all().await;
        }
        Ok(())
    }

    async fn discard(&mut self) -> StorageResult<()> {
        self.file.take();
        match fs::remove_file(&self.staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::upload_failed("writer already closed"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<BlobInfo> {
        if let Err(e) = self.publish().await {
            if let Err(discard_err) = self.discard().await {
                warn!(blob_id = %self.blob_id, "Failed to clean staging file: {}", discard_err);
            }
            self.done = true;
            return Err(StorageError::upload_failed(e.to_string()));
        }
        self.done = true;

        debug!(blob_id = %self.blob_id, bytes = self.written, "Published blob");

        Ok(BlobInfo {
            blob_id: self.blob_id.clone(),
            size: self.written,
            metadata: self.metadata.clone(),
            created_at: Some(Utc::now()),
        })
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.done = true;
        self.discard().await
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl Drop for FsBlobWriter {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{read_to_end, split_chunks, write_stream};

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    async fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::open(dir.path())
            .await
            .expect("open store")
            .with_read_chunk_size(64 * 1024);
        (dir, store)
    }

    async fn write_all(store: &FsBlobStore, blob_id: &BlobId, data: Bytes, chunk: usize) {
        let mut writer = store
            .create_writer(blob_id, BlobMetadata::video("u1"))
            .await
            .unwrap();
        for part in split_chunks(data, chunk) {
            writer.write_chunk(part).await.unwrap();
        }
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn roundtrip_preserves_bytes_across_sizes() {
        let (_dir, store) = store().await;

        for (i, len) in [0usize, 1, 1023, 1024, 65_537, 3 * 1024 * 1024 + 7]
            .into_iter()
            .enumerate()
        {
            let blob_id = BlobId::from(format!("blob-{}", i));
            let data = pattern(len);
            write_all(&store, &blob_id, data.clone(), 10_000).await;

            let reader = store.open_reader(&blob_id).await.unwrap();
            assert_eq!(reader.info().size, len as u64);
            let read = read_to_end(reader, u64::MAX).await.unwrap();
            assert_eq!(read, data, "mismatch for {} bytes", len);
        }
    }

    #[tokio::test]
    async fn reader_streams_in_bounded_chunks() {
        let (_dir, store) = store().await;
        let blob_id = BlobId::from("chunked");
        write_all(&store, &blob_id, pattern(200_000), 7_000).await;

        let mut reader = store.open_reader(&blob_id).await.unwrap();
        let mut count = 0;
        while let Some(chunk) = reader.next().await {
            assert!(chunk.unwrap().len() <= 64 * 1024);
            count += 1;
        }
        assert!(count >= 4);
    }

    #[tokio::test]
    async fn unfinished_write_is_invisible() {
        let (_dir, store) = store().await;
        let blob_id = BlobId::from("partial");

        let mut writer = store
            .create_writer(&blob_id, BlobMetadata::default())
            .await
            .unwrap();
        writer.write_chunk(pattern(100)).await.unwrap();

        assert!(store.stat(&blob_id).await.unwrap().is_none());
        writer.abort().await.unwrap();
        assert!(store.stat(&blob_id).await.unwrap().is_none());

        let mut writer = store
            .create_writer(&blob_id, BlobMetadata::default())
            .await
            .unwrap();
        writer.write_chunk(pattern(100)).await.unwrap();
        drop(writer);
        assert!(matches!(
            store.open_reader(&blob_id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_stream_leaves_previous_blob_intact() {
        let (_dir, store) = store().await;
        let blob_id = BlobId::from("video-j1");
        write_all(&store, &blob_id, pattern(5000), 1000).await;

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"new data")),
            Err(StorageError::download_failed("source went away")),
        ]);
        let result = write_stream(&store, &blob_id, BlobMetadata::default(), chunks).await;
        assert!(result.is_err());

        let read = read_to_end(store.open_reader(&blob_id).await.unwrap(), u64::MAX)
            .await
            .unwrap();
        assert_eq!(read, pattern(5000));
    }

    #[tokio::test]
    async fn rewriting_same_id_converges_without_duplication() {
        let (_dir, store) = store().await;
        let blob_id = BlobId::from("video-j1");
        let data = pattern(1024);

        write_all(&store, &blob_id, data.clone(), 100).await;
        write_all(&store, &blob_id, data.clone(), 333).await;

        let info = store.stat(&blob_id).await.unwrap().unwrap();
        assert_eq!(info.size, 1024);
        let read = read_to_end(store.open_reader(&blob_id).await.unwrap(), u64::MAX)
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn metadata_survives_roundtrip() {
        let (_dir, store) = store().await;
        let blob_id = BlobId::from("with-meta");
        let metadata = BlobMetadata::video("u1").with_filename("Untitled Video.mp4");

        let mut writer = store.create_writer(&blob_id, metadata.clone()).await.unwrap();
        writer.write_chunk(pattern(10)).await.unwrap();
        writer.finish().await.unwrap();

        let reader = store.open_reader(&blob_id).await.unwrap();
        assert_eq!(reader.info().metadata, metadata);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.open_reader(&BlobId::from("nope")).await.err().unwrap();
        assert!(err.is_not_found());
        tokio_test::assert_ok!(store.delete(&BlobId::from("nope")).await);
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let (_dir, store) = store().await;
        let err = store
            .create_writer(&BlobId::from("../escape"), BlobMetadata::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn ids_sharing_a_prefix_stay_independent() {
        let (_dir, store) = store().await;
        let base = BlobId::from("a");
        let sibling = BlobId::from("a.meta.json");

        write_all(&store, &base, pattern(300), 100).await;
        let mut writer = store
            .create_writer(&sibling, BlobMetadata::default())
            .await
            .unwrap();
        writer.write_chunk(Bytes::from_static(b"garbage")).await.unwrap();
        writer.finish().await.unwrap();

        let info = store.stat(&base).await.unwrap().unwrap();
        assert_eq!(info.size, 300);
        assert_eq!(info.metadata.owner.as_deref(), Some("u1"));
        let read = read_to_end(store.open_reader(&base).await.unwrap(), u64::MAX)
            .await
            .unwrap();
        assert_eq!(read, pattern(300));

        let read = read_to_end(store.open_reader(&sibling).await.unwrap(), u64::MAX)
            .await
            .unwrap();
        assert_eq!(read, Bytes::from_static(b"garbage"));
    }

    #[tokio::test]
    async fn overwrite_swaps_data_and_metadata_together() {
        let (dir, store) = store().await;
        let blob_id = BlobId::from("video-j2");
        write_all(&store, &blob_id, pattern(4000), 1000).await;

        let metadata = BlobMetadata::default()
            .with_content_type("video/webm")
            .with_filename("second.webm");
        let mut writer = store.create_writer(&blob_id, metadata.clone()).await.unwrap();
        writer.write_chunk(pattern(10)).await.unwrap();
        writer.finish().await.unwrap();

        let info = store.stat(&blob_id).await.unwrap().unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(info.metadata, metadata);

        // One published file per blob and nothing left in staging.
        let mut published = std::fs::read_dir(dir.path().join("blobs")).unwrap();
        assert!(published.next().is_some());
        assert!(published.next().is_none());
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn corrupt_header_is_an_error_not_a_blob() {
        let (dir, store) = store().await;
        std::fs::write(dir.path().join("blobs").join("broken"), [0xff, 0xff, 0xff, 0xff, 1]).unwrap();

        let err = store.stat(&BlobId::from("broken")).await.unwrap_err();
        assert!(matches!(err, StorageError::DownloadFailed(_)));
    }
}
