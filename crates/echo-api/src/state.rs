//! Application state.

use std::sync::Arc;

use echo_queue::{open_job_queue, JobQueue, QueueConfig};
use echo_storage::{open_blob_store, BlobStore};

use crate::config::ApiConfig;
use crate::services::{JobProducer, ResultLookup};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn BlobStore>,
    pub producer: JobProducer,
    pub lookup: ResultLookup,
}

impl AppState {
    /// Assemble state around already-open backends.
    pub fn new(config: ApiConfig, queue: Arc<dyn JobQueue>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            config: Arc::new(config),
            producer: JobProducer::new(Arc::clone(&queue)),
            lookup: ResultLookup::new(Arc::clone(&queue), Arc::clone(&store)),
            queue,
            store,
        }
    }

    /// Open the backends named by the pipeline config.
    pub async fn from_config(config: ApiConfig) -> anyhow::Result<Self> {
        config.pipeline.validate()?;

        let queue = open_job_queue(
            &config.pipeline.queue_backend_address,
            QueueConfig::from_pipeline(&config.pipeline),
        )?;
        let store = open_blob_store(&config.pipeline.blob_store_backend_address).await?;

        Ok(Self::new(config, queue, store))
    }
}
