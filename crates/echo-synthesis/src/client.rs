//! HTTP synthesis client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, warn};

use echo_models::VIDEO_CONTENT_TYPE;

use crate::error::{SynthesisError, SynthesisResult};
use crate::types::{HealthResponse, SynthesisRequest, SynthesizedVideo, VideoPayloadResponse};
use crate::Synthesizer;

/// Configuration for the synthesis client.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Render endpoint
    pub url: String,
    /// Health endpoint, when the service exposes one
    pub health_url: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001/synthesize".to_string(),
            health_url: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SynthesisConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("SYNTHESIS_URL").unwrap_or(defaults.url),
            health_url: std::env::var("SYNTHESIS_HEALTH_URL").ok(),
            connect_timeout: std::env::var("SYNTHESIS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        }
    }
}

/// Synthesizer calling a remote HTTP service.
pub struct HttpSynthesizer {
    http: Client,
    config: SynthesisConfig,
}

impl HttpSynthesizer {
    /// Create a new client.
    ///
    /// No overall request timeout is set here: each call gets its own hard
    /// timeout from the caller.
    pub fn new(config: SynthesisConfig) -> SynthesisResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SynthesisError::Config(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> SynthesisResult<Self> {
        Self::new(SynthesisConfig::from_env())
    }

    async fn render(&self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedVideo> {
        debug!(job_id = %request.job_id, "Sending synthesis request to {}", self.config.url);

        let response = self
            .http
            .post(&self.config.url)
            .header("Idempotency-Key", &request.job_id)
            .json(request)
            .send()
            .await
            .map_err(SynthesisError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::rejected(status.as_u16(), body));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        let video = match content_type.as_deref() {
            Some("application/json") => response
                .json::<VideoPayloadResponse>()
                .await
                .map_err(|e| SynthesisError::invalid_response(e.to_string()))?
                .into_video()?,
            other => {
                let media_type = match other {
                    Some(t) if t.starts_with("video/") => t.to_string(),
                    _ => VIDEO_CONTENT_TYPE.to_string(),
                };
                let bytes = response.bytes().await.map_err(SynthesisError::from_transport)?;
                SynthesizedVideo::new(media_type, bytes)
            }
        };

        if video.is_empty() {
            return Err(SynthesisError::invalid_response("empty video payload"));
        }
        Ok(video)
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        timeout: Duration,
    ) -> SynthesisResult<SynthesizedVideo> {
        // Dropping the request future on timeout closes the connection.
        match tokio::time::timeout(timeout, self.render(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %request.job_id, "Synthesis timed out after {:?}", timeout);
                Err(SynthesisError::Timeout(timeout))
            }
        }
    }

    async fn health_check(&self) -> SynthesisResult<bool> {
        let Some(url) = &self.config.health_url else {
            return Ok(true);
        };

        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthResponse>().await {
                    Ok(health) => Ok(health.status == "healthy" || health.status == "ok"),
                    Err(_) => Ok(true),
                }
            }
            Ok(response) => {
                warn!("Synthesis service health check failed: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Synthesis service health check error: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encode_data_url;
    use echo_models::{JobId, SynthesisPayload};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn request() -> SynthesisRequest {
        SynthesisRequest::for_job(
            &JobId::from("j1"),
            &SynthesisPayload::new("u1", "hello", "a1", "v1"),
        )
    }

    fn client(server: &MockServer) -> HttpSynthesizer {
        HttpSynthesizer::new(SynthesisConfig {
            url: format!("{}/synthesize", server.uri()),
            health_url: Some(format!("{}/health", server.uri())),
            ..SynthesisConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn binary_response_is_returned_as_is() {
        let server = MockServer::start().await;
        let body = vec![7u8; 1024];
        Mock::given(method("POST"))
            .and(path("/synthesize"))
            .and(header("Idempotency-Key", "j1"))
            .and(body_partial_json(serde_json::json!({
                "recipientIdentity": "u1",
                "audioReferenceID": "a1",
                "videoAvatarReferenceID": "v1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.clone(), "video/mp4"))
            .expect(1)
            .mount(&server)
            .await;

        let video = client(&server).synthesize(&request(), TIMEOUT).await.unwrap();
        assert_eq!(video.content_type, "video/mp4");
        assert_eq!(video.bytes.to_vec(), body);
    }

    #[tokio::test]
    async fn json_data_url_response_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "video": encode_data_url("video/mp4", b"rendered"),
            })))
            .mount(&server)
            .await;

        let video = client(&server).synthesize(&request(), TIMEOUT).await.unwrap();
        assert_eq!(&video.bytes[..], b"rendered");
    }

    #[tokio::test]
    async fn error_status_is_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("unknown avatar"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).synthesize(&request(), TIMEOUT).await.unwrap_err();
        match err {
            SynthesisError::Rejected { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "unknown avatar");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_service_hits_hard_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(vec![1u8; 16], "video/mp4")
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = client(&server)
            .synthesize(&request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn empty_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(Vec::new(), "video/mp4"))
            .mount(&server)
            .await;

        let err = client(&server).synthesize(&request(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let client = HttpSynthesizer::new(SynthesisConfig {
            url: "http://127.0.0.1:1/synthesize".to_string(),
            ..SynthesisConfig::default()
        })
        .unwrap();

        let err = client.synthesize(&request(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Unavailable(_)));
    }

    #[tokio::test]
    async fn health_check_reads_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})),
            )
            .mount(&server)
            .await;

        assert!(client(&server).health_check().await.unwrap());
    }
}
