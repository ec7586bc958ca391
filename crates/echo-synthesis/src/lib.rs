//! Client for the remote speech and video synthesis service.
//!
//! One call renders one video. Every call carries a hard timeout and is
//! never retried here; retries belong to the job queue.

pub mod client;
pub mod error;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;

pub use client::{HttpSynthesizer, SynthesisConfig};
pub use error::{SynthesisError, SynthesisResult};
pub use types::{decode_data_url, encode_data_url, SynthesisRequest, SynthesizedVideo};

/// Renders a talking-head video for one request.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render the video, giving up after `timeout`.
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        timeout: Duration,
    ) -> SynthesisResult<SynthesizedVideo>;

    /// Whether the service looks healthy.
    async fn health_check(&self) -> SynthesisResult<bool> {
        Ok(true)
    }
}
