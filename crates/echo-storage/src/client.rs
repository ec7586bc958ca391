//! R2 / S3-compatible blob store.
//!
//! Writers stream chunks into a multipart upload, buffering only up to one
//! part. The object becomes visible when the upload is completed, so readers
//! never see a partial video. Small objects skip multipart and use a single
//! `PutObject`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use echo_models::BlobId;

use crate::error::{StorageError, StorageResult};
use crate::store::{ensure_valid, BlobInfo, BlobMetadata, BlobReader, BlobStore, BlobWriter};

/// Smallest part size S3 accepts for all but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default multipart part size.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

const META_OWNER: &str = "owner";
const META_FILENAME: &str = "filename";

/// Configuration for the R2 client.
#[derive(Debug, Clone)]
pub struct R2Config {
    /// S3 API endpoint (required for R2, optional for AWS)
    pub endpoint_url: Option<String>,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Key prefix inside the bucket
    pub key_prefix: String,
    /// Region (usually "auto" for R2)
    pub region: String,
    /// Multipart part size in bytes
    pub part_size: usize,
}

impl R2Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let bucket_name = std::env::var("R2_BUCKET_NAME")
            .map_err(|_| StorageError::config_error("R2_BUCKET_NAME not set"))?;
        Self::from_env_for_bucket(bucket_name, "")
    }

    /// Read credentials from the environment for an explicitly named bucket.
    pub fn from_env_for_bucket(
        bucket_name: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("R2_ENDPOINT_URL").ok(),
            access_key_id: std::env::var("R2_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("R2_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("R2_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("R2_SECRET_ACCESS_KEY not set"))?,
            bucket_name: bucket_name.into(),
            key_prefix: key_prefix.into(),
            region: std::env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
            part_size: std::env::var("R2_PART_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PART_SIZE),
        })
    }
}

/// Blob store backed by an R2 bucket.
#[derive(Clone)]
pub struct R2BlobStore {
    client: Client,
    bucket: String,
    key_prefix: String,
    part_size: usize,
}

impl R2BlobStore {
    /// Create a new store from configuration.
    pub fn new(config: R2Config) -> StorageResult<Self> {
        if config.bucket_name.is_empty() {
            return Err(StorageError::config_error("bucket name is empty"));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        let key_prefix = config.key_prefix.trim_matches('/').to_string();

        info!(
            bucket = %config.bucket_name,
            prefix = %key_prefix,
            "Configured R2 blob store"
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name,
            key_prefix,
            part_size: config.part_size.max(MIN_PART_SIZE),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Self::new(R2Config::from_env()?)
    }

    fn object_key(&self, blob_id: &BlobId) -> String {
        if self.key_prefix.is_empty() {
            blob_id.as_str().to_string()
        } else {
            format!("{}/{}", self.key_prefix, blob_id)
        }
    }
}

fn user_metadata(metadata: &BlobMetadata) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(owner) = &metadata.owner {
        map.insert(META_OWNER.to_string(), owner.clone());
    }
    if let Some(filename) = &metadata.filename {
        map.insert(META_FILENAME.to_string(), filename.clone());
    }
    map
}

fn metadata_from_parts(
    content_type: Option<&str>,
    user: Option<&HashMap<String, String>>,
) -> BlobMetadata {
    let mut metadata = BlobMetadata::default();
    if let Some(content_type) = content_type {
        metadata.content_type = content_type.to_string();
    }
    if let Some(user) = user {
        metadata.owner = user.get(META_OWNER).cloned();
        metadata.filename = user.get(META_FILENAME).cloned();
    }
    metadata
}

fn to_chrono(ts: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| t.to_millis().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

#[async_trait]
impl BlobStore for R2BlobStore {
    async fn create_writer(
        &self,
        blob_id: &BlobId,
        metadata: BlobMetadata,
    ) -> StorageResult<Box<dyn BlobWriter>> {
        ensure_valid(blob_id)?;

        Ok(Box::new(R2BlobWriter {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.object_key(blob_id),
            blob_id: blob_id.clone(),
            metadata,
            part_size: self.part_size,
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
            written: 0,
            done: false,
        }))
    }

    async fn open_reader(&self, blob_id: &BlobId) -> StorageResult<BlobReader> {
        ensure_valid(blob_id)?;
        let key = self.object_key(blob_id);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StorageError::not_found(blob_id.as_str())
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let info = BlobInfo {
            blob_id: blob_id.clone(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            metadata: metadata_from_parts(response.content_type(), response.metadata()),
            created_at: to_chrono(response.last_modified()),
        };

        let chunks = stream::unfold(Some(response.body), |state| async move {
            let mut body = state?;
            match body.next().await {
                Some(Ok(bytes)) => Some((Ok(bytes), Some(body))),
                Some(Err(e)) => Some((Err(StorageError::download_failed(e.to_string())), None)),
                None => None,
            }
        })
        .boxed();

        Ok(BlobReader::new(info, chunks))
    }

    async fn stat(&self, blob_id: &BlobId) -> StorageResult<Option<BlobInfo>> {
        ensure_valid(blob_id)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(blob_id))
            .send()
            .await
        {
            Ok(head) => Ok(Some(BlobInfo {
                blob_id: blob_id.clone(),
                size: head.content_length().unwrap_or(0).max(0) as u64,
                metadata: metadata_from_parts(head.content_type(), head.metadata()),
                created_at: to_chrono(head.last_modified()),
            })),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if missing {
                    Ok(None)
                } else {
                    Err(StorageError::AwsSdk(e.to_string()))
                }
            }
        }
    }

    async fn delete(&self, blob_id: &BlobId) -> StorageResult<()> {
        ensure_valid(blob_id)?;
        let key = self.object_key(blob_id);
        debug!("Deleting {}", key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;

        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("R2 connectivity check failed: {}", e)))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "r2"
    }
}

/// Writer streaming one object into a multipart upload.
struct R2BlobWriter {
    client: Client,
    bucket: String,
    key: String,
    blob_id: BlobId,
    metadata: BlobMetadata,
    part_size: usize,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    written: u64,
    done: bool,
}

impl R2BlobWriter {
    async fn ensure_upload(&mut self) -> StorageResult<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.metadata.content_type)
            .set_metadata(Some(user_metadata(&self.metadata)))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let id = created
            .upload_id()
            .ok_or_else(|| StorageError::upload_failed("no upload id returned"))?
            .to_string();
        debug!(key = %self.key, upload_id = %id, "Started multipart upload");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(response.e_tag().map(str::to_string))
                .build(),
        );
        Ok(())
    }

    async fn put_single(&mut self, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.metadata.content_type)
            .set_metadata(Some(user_metadata(&self.metadata)))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        Ok(())
    }

    async fn complete(&mut self) -> StorageResult<()> {
        if self.upload_id.is_none() {
            let data = self.buffer.split().freeze();
            return self.put_single(data).await;
        }

        if !self.buffer.is_empty() {
            let data = self.buffer.split().freeze();
            self.upload_part(data).await?;
        }

        let upload_id = self.ensure_upload().await?;
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.parts)))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        Ok(())
    }

    async fn abort_upload(&mut self) -> StorageResult<()> {
        self.buffer.clear();
        let Some(upload_id) = self.upload_id.take() else {
            return Ok(());
        };
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BlobWriter for R2BlobWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.written += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);

        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<BlobInfo> {
        if let Err(e) = self.complete().await {
            if let Err(abort_err) = self.abort_upload().await {
                warn!(key = %self.key, "Failed to abort multipart upload: {}", abort_err);
            }
            self.done = true;
            return Err(e);
        }
        self.done = true;

        info!(key = %self.key, bytes = self.written, "Uploaded blob");

        Ok(BlobInfo {
            blob_id: self.blob_id.clone(),
            size: self.written,
            metadata: self.metadata.clone(),
            created_at: Some(Utc::now()),
        })
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.done = true;
        self.abort_upload().await
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl Drop for R2BlobWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Dropped multipart upload outside a runtime");
            return;
        };

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        handle.spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(key = %key, "Failed to abort dropped multipart upload: {}", e);
            }
        });
    }
}
