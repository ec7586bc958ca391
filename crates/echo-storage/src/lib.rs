//! Blob storage for rendered videos.
//!
//! This crate provides:
//! - A backend-neutral [`BlobStore`] trait with chunked writers and streaming readers
//! - A local filesystem backend
//! - A Cloudflare R2 / S3-compatible backend using multipart uploads
//! - Address-based backend selection

pub mod client;
pub mod error;
pub mod fs;
pub mod store;

use std::sync::Arc;

use tracing::info;
use url::Url;

pub use client::{R2BlobStore, R2Config};
pub use error::{StorageError, StorageResult};
pub use fs::FsBlobStore;
pub use store::{
    read_to_end, split_chunks, write_stream, BlobInfo, BlobMetadata, BlobReader, BlobStore,
    BlobWriter,
};

/// Open the blob store named by `address`.
///
/// Supported schemes:
/// - `file:///path/to/dir`
/// - `s3://bucket/optional/prefix` or `r2://bucket/optional/prefix`, with
///   credentials taken from the `R2_*` environment variables
pub async fn open_blob_store(address: &str) -> StorageResult<Arc<dyn BlobStore>> {
    let url = Url::parse(address)
        .map_err(|e| StorageError::config_error(format!("invalid blob store address: {}", e)))?;

    let store: Arc<dyn BlobStore> = match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|_| {
                StorageError::config_error(format!("invalid file address: {}", address))
            })?;
            Arc::new(FsBlobStore::open(path).await?)
        }
        "s3" | "r2" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| StorageError::config_error("blob store address has no bucket"))?;
            let config = R2Config::from_env_for_bucket(bucket, url.path())?;
            Arc::new(R2BlobStore::new(config)?)
        }
        other => {
            return Err(StorageError::config_error(format!(
                "unsupported blob store scheme: {}",
                other
            )));
        }
    };

    info!(backend = store.backend_name(), "Blob store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_filesystem_store_from_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("file://{}", dir.path().display());
        let store = open_blob_store(&address).await.unwrap();
        assert_eq!(store.backend_name(), "fs");
        store.check_connectivity().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_schemes() {
        let err = open_blob_store("ftp://host/dir").await.err().unwrap();
        assert!(matches!(err, StorageError::ConfigError(_)));

        let err = open_blob_store("not a url").await.err().unwrap();
        assert!(matches!(err, StorageError::ConfigError(_)));
    }
}
